//! JSON-on-disk storage for the definitions and performance files.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use super::error::{WorkerError, WorkerResult};

/// Parses a JSON array. Blank content is an empty array.
pub fn parse_json_array<T: DeserializeOwned>(content: &str) -> WorkerResult<Vec<T>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(content)?)
}

pub async fn read_file(path: &Path) -> WorkerResult<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| WorkerError::io(path, e))
}

/// Reads a JSON array file; a missing file reads as empty.
pub async fn read_json_array_or_empty<T: DeserializeOwned>(path: &Path) -> WorkerResult<Vec<T>> {
    match fs::read_to_string(path).await {
        Ok(content) => parse_json_array(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no existing file, starting empty");
            Ok(Vec::new())
        }
        Err(e) => Err(WorkerError::io(path, e)),
    }
}

/// Writes pretty-printed JSON, replacing the target atomically.
pub async fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> WorkerResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomically(path, &json).await
}

async fn write_atomically(path: &Path, data: &[u8]) -> WorkerResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| WorkerError::InvalidArgument(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)
        .await
        .map_err(|e| WorkerError::io(dir, e))?;

    let temp_file = NamedTempFile::new_in(dir).map_err(|e| WorkerError::io(dir, e))?;
    let temp_path = temp_file.path().to_path_buf();

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| WorkerError::io(&temp_path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| WorkerError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| WorkerError::io(&temp_path, e))?;
    drop(file);

    temp_file
        .persist(path)
        .map_err(|e| WorkerError::io(path, e.error))?;
    debug!(path = %path.display(), bytes = data.len(), "file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data.json");
        write_json_pretty(&path, &vec![1, 2, 3]).await.unwrap();

        let content = read_file(&path).await.unwrap();
        assert!(content.contains('\n'));
        let values: Vec<i32> = read_json_array_or_empty(&path).await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        write_json_pretty(&path, &vec![4]).await.unwrap();
        let values: Vec<i32> = read_json_array_or_empty(&path).await.unwrap();
        assert_eq!(values, vec![4]);
    }

    #[tokio::test]
    async fn test_missing_and_blank() {
        let dir = TempDir::new().unwrap();
        let values: Vec<i32> = read_json_array_or_empty(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(values.is_empty());
        assert!(parse_json_array::<i32>("  \n").unwrap().is_empty());
        assert!(parse_json_array::<i32>("{").is_err());
    }
}
