//! Tag file and keyring file I/O (§6 "Environment and files"). Both are
//! collaborator-facing contracts rather than core engine state: the tags
//! file is a whole-file JSON map rewritten on every `SetTags`, the keyring
//! file an atomically-replaced JSON list of base64 keys rewritten on every
//! rotation.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

pub fn load_tags_file(path: &Path) -> io::Result<HashMap<String, String>> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_tags_file(path: &Path, tags: &HashMap<String, String>) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(tags).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, data)
}

pub fn load_keyring_file(path: &Path) -> io::Result<Vec<Vec<u8>>> {
    let data = fs::read(path)?;
    let encoded: Vec<String> = serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    encoded
        .into_iter()
        .map(|s| base64::decode(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)))
        .collect()
}

/// Atomic replace: write to a sibling temp file, then rename over the
/// target, so a crash mid-write never leaves a truncated keyring file.
pub fn write_keyring_file(path: &Path, keys: &[Vec<u8>]) -> io::Result<()> {
    let encoded: Vec<String> = keys.iter().map(base64::encode).collect();
    let data = serde_json::to_vec_pretty(&encoded).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_file_round_trips() {
        let path = std::env::temp_dir().join(format!("serf-agent-tags-test-{}.json", std::process::id()));
        let mut tags = HashMap::new();
        tags.insert("role".to_string(), "leader".to_string());
        write_tags_file(&path, &tags).unwrap();
        let loaded = load_tags_file(&path).unwrap();
        assert_eq!(loaded, tags);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn keyring_file_round_trips_and_replaces_atomically() {
        let path = std::env::temp_dir().join(format!("serf-agent-keyring-test-{}.json", std::process::id()));
        let keys = vec![vec![0u8; 16], vec![1u8; 32]];
        write_keyring_file(&path, &keys).unwrap();
        let loaded = load_keyring_file(&path).unwrap();
        assert_eq!(loaded, keys);

        write_keyring_file(&path, &[vec![2u8; 16]]).unwrap();
        let loaded = load_keyring_file(&path).unwrap();
        assert_eq!(loaded, vec![vec![2u8; 16]]);
        fs::remove_file(&path).ok();
    }
}
