//! In-memory image store with checksum-derived file names.
//!
//! Cached images are named `<sha1(content)>.<ext>`, the extension
//! sniffed from the payload's magic bytes. The friendly filename falls
//! back to the generated name when the image has no path of its own.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::digest::sha1_hex;

/// An image held in memory.
#[derive(Debug, Clone)]
pub struct Image {
    /// Raw payload.
    pub contents: Vec<u8>,
    /// Source path, when loaded from disk.
    pub path: Option<String>,
}

impl Image {
    /// Wrap raw bytes.
    pub fn from_bytes(contents: Vec<u8>) -> Self {
        Self {
            contents,
            path: None,
        }
    }

    /// File extension sniffed from the first magic bytes, `None` when
    /// the payload matches no known format.
    pub fn extension(&self) -> Option<&'static str> {
        let data = self.contents.as_slice();
        if data.starts_with(b"GIF8") {
            Some("gif")
        } else if data.starts_with(&[0xFF, 0xD8]) {
            Some("jpg")
        } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some("png")
        } else if data.starts_with(b"II*\0") || data.starts_with(b"MM\0*") {
            Some("tif")
        } else if data.starts_with(b"BM") {
            Some("bmp")
        } else if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
            Some("ico")
        } else {
            None
        }
    }

    /// Cache filename: SHA-1 of the content plus the sniffed extension
    /// (`icon` when the format is unknown).
    pub fn generated_filename(&self) -> String {
        let checksum = sha1_hex(&self.contents);
        match self.extension() {
            Some(ext) => format!("{checksum}.{ext}"),
            None => format!("{checksum}.icon"),
        }
    }

    /// Name to show a user: the basename of the source path when the
    /// image came from disk, else the checksum-derived name.
    pub fn friendly_filename(&self) -> String {
        match &self.path {
            Some(path) => path
                .rsplit('/')
                .next()
                .filter(|base| !base.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| self.generated_filename()),
            None => self.generated_filename(),
        }
    }
}

/// Process-wide image cache keyed by generated filename.
#[derive(Debug, Default)]
pub struct ImageStore {
    images: Mutex<HashMap<String, Image>>,
}

impl ImageStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an image, returning its cache id. Identical content
    /// lands on the same id.
    pub fn insert(&self, image: Image) -> String {
        let id = image.generated_filename();
        self.images.lock().unwrap().insert(id.clone(), image);
        id
    }

    /// Fetch an image by cache id.
    pub fn get(&self, id: &str) -> Option<Image> {
        self.images.lock().unwrap().get(id).cloned()
    }

    /// Drop an image.
    pub fn remove(&self, id: &str) {
        self.images.lock().unwrap().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_sniffing() {
        assert_eq!(Image::from_bytes(b"GIF89a...".to_vec()).extension(), Some("gif"));
        assert_eq!(Image::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xE0]).extension(), Some("jpg"));
        assert_eq!(
            Image::from_bytes(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A]).extension(),
            Some("png")
        );
        assert_eq!(Image::from_bytes(b"II*\0rest".to_vec()).extension(), Some("tif"));
        assert_eq!(Image::from_bytes(b"BMxxxx".to_vec()).extension(), Some("bmp"));
        assert_eq!(Image::from_bytes(vec![0, 0, 1, 0, 2]).extension(), Some("ico"));
        assert_eq!(Image::from_bytes(b"plain text".to_vec()).extension(), None);
    }

    #[test]
    fn test_generated_filename_is_checksum_dot_ext() {
        let image = Image::from_bytes(b"GIF89a".to_vec());
        let name = image.generated_filename();
        assert_eq!(name, format!("{}.gif", sha1_hex(b"GIF89a")));
    }

    #[test]
    fn test_friendly_filename_falls_back_to_checksum_name() {
        let mut image = Image::from_bytes(b"BMdata".to_vec());
        assert_eq!(image.friendly_filename(), image.generated_filename());

        image.path = Some("/home/alice/pics/cat.bmp".into());
        assert_eq!(image.friendly_filename(), "cat.bmp");
    }

    #[test]
    fn test_store_deduplicates_identical_content() {
        let store = ImageStore::new();
        let a = store.insert(Image::from_bytes(b"GIF89a".to_vec()));
        let b = store.insert(Image::from_bytes(b"GIF89a".to_vec()));
        assert_eq!(a, b);
        assert!(store.get(&a).is_some());
    }
}
