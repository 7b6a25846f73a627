use std::fs;
use std::io;
use std::path::Path;

use rand::distributions::Distribution;
use rand::distributions::Uniform;

pub fn path_exists<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).is_ok()
}

pub fn is_file<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub fn is_directory<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    if !is_directory(path.as_ref()) {
        fs::create_dir_all(path.as_ref()).map(|()| true)
    } else {
        Ok(false)
    }
}

pub fn remove_file(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

pub fn remove_dir_all(path: &Path) -> io::Result<()> {
    fs::remove_dir_all(path)
}

/// A random lowercase hex string of the given length.
pub(crate) fn random_hex_string(length: usize) -> String {
    let chars = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let dist = Uniform::new(0, chars.len());
    (0..length).map(|_| chars[dist.sample(&mut rng)] as char).collect()
}
