use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::report::ArtifactRecord;

/// Hex SHA256 digest of the file at `path`.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Writes `<digest>  <path>` for `path` into `output`.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    let mut file = create_with_parent(output)?;
    writeln!(file, "{}  {}", digest, path.display()).with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'.",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}

/// Writes a `sha256sum`-compatible listing of every file artifact that was
/// hashed during the run. Returns the number of lines written.
pub fn write_checksums(artifacts: &[ArtifactRecord], output: &Path) -> Result<usize> {
    let mut file = create_with_parent(output)?;
    let mut written = 0;
    for artifact in artifacts {
        if let Some(digest) = &artifact.sha256 {
            writeln!(file, "{}  {}", digest, artifact.value.render())
                .with_context(|| format!("Failed to write checksums: {}", output.display()))?;
            written += 1;
        }
    }
    Ok(written)
}

fn create_with_parent(output: &Path) -> Result<File> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    File::create(output).with_context(|| format!("Failed to create digest file: {}", output.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactValue;
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        std::fs::write(&file_path, b"abc").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn checksums_list_only_hashed_artifacts() {
        let temp = tempdir().unwrap();
        let output = temp.path().join("out/SHA256SUMS");
        let records = vec![
            ArtifactRecord {
                key: "report".into(),
                producer: "scan".into(),
                value: ArtifactValue::Path("reports/scan.sarif".into()),
                sha256: Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".into()),
            },
            ArtifactRecord {
                key: "image".into(),
                producer: "build".into(),
                value: ArtifactValue::Value("app:1".into()),
                sha256: None,
            },
        ];

        assert_eq!(write_checksums(&records, &output).unwrap(), 1);
        let contents = std::fs::read_to_string(&output).unwrap();
        assert_eq!(
            contents,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855  reports/scan.sarif\n"
        );
    }
}
