//! NVRAM TLV store
//!
//! Small tagged records persisted to a non-volatile device in a checksummed image.
//! The in-memory cache is the source of truth; every successful mutation re-encodes
//! the whole image and writes it back.
//!
//! # Image Layout
//!
//! All integers big-endian; the image is exactly the device size.
//!
//! ```text
//! [0:4)     magic b"TLV\0"
//! [4:5)     version (1)
//! [5:7)     N: end offset of the record region, u16
//! [7:N)     records: tag u64, length u32, payload
//! [N:N+4)   CRC32 over [0:N)
//! [N+4:..)  zero fill
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use cm_error::{ChassisError, Result};
use cm_protocol::{Notification, NvramView, ResourceClass};
use crc32fast::Hasher as Crc32Hasher;
use tracing::{debug, info, warn};

use crate::constants::nvram;
use crate::store::ResourceKey;
use crate::views;

/// Byte-addressable non-volatile device
pub trait NvramDevice: Send {
    fn size(&self) -> usize;

    fn read(&mut self) -> Result<Vec<u8>>;

    fn write(&mut self, image: &[u8]) -> Result<()>;
}

/// Device backed by a regular file of fixed size
#[derive(Debug)]
pub struct FileNvram {
    path: PathBuf,
    size: usize,
}

impl FileNvram {
    /// Open the backing file, creating it zero-filled if missing
    pub fn open(path: &Path, size: usize) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, vec![0u8; size])
                .map_err(|e| ChassisError::FileWrite { path: path.to_path_buf(), source: e })?;
            info!("Created NVRAM backing file {:?} ({} bytes)", path, size);
        }
        Ok(Self { path: path.to_path_buf(), size })
    }
}

impl NvramDevice for FileNvram {
    fn size(&self) -> usize {
        self.size
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let mut image = fs::read(&self.path)
            .map_err(|e| ChassisError::FileRead { path: self.path.clone(), source: e })?;
        image.resize(self.size, 0);
        Ok(image)
    }

    fn write(&mut self, image: &[u8]) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, image)
            .map_err(|e| ChassisError::FileWrite { path: temp_path.clone(), source: e })?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| ChassisError::FileWrite { path: self.path.clone(), source: e })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvramEntry {
    pub tag: u64,
    pub data: Vec<u8>,
}

fn crc32_of(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn corrupted(reason: impl Into<String>) -> ChassisError {
    ChassisError::NvramCorrupted(reason.into())
}

/// Whether the image carries our magic and version at all
pub fn is_formatted(image: &[u8]) -> bool {
    image.len() > nvram::HEADER_LEN && image[..4] == nvram::MAGIC && image[4] == nvram::VERSION
}

/// Decode an image into entries in stored order, truncating oversized payloads
pub fn decode(image: &[u8]) -> Result<Vec<NvramEntry>> {
    if image.len() < nvram::HEADER_LEN + nvram::CRC_LEN {
        return Err(corrupted(format!("image too short: {} bytes", image.len())));
    }
    if image[..4] != nvram::MAGIC {
        return Err(corrupted("bad magic"));
    }
    if image[4] != nvram::VERSION {
        return Err(corrupted(format!("unsupported version {}", image[4])));
    }

    let end = usize::from(u16::from_be_bytes([image[5], image[6]]));
    if end < nvram::HEADER_LEN || end > image.len() - nvram::CRC_LEN {
        return Err(corrupted(format!("record region end {} out of range", end)));
    }
    let stored_crc =
        u32::from_be_bytes([image[end], image[end + 1], image[end + 2], image[end + 3]]);
    let computed_crc = crc32_of(&image[..end]);
    if stored_crc != computed_crc {
        return Err(corrupted(format!(
            "CRC mismatch: stored {:08x}, computed {:08x}",
            stored_crc, computed_crc
        )));
    }

    let mut entries = Vec::new();
    let mut cursor = nvram::HEADER_LEN;
    while cursor < end {
        if cursor + nvram::RECORD_HEADER_LEN > end {
            return Err(corrupted(format!("truncated record header at offset {}", cursor)));
        }
        let mut tag_bytes = [0u8; 8];
        tag_bytes.copy_from_slice(&image[cursor..cursor + 8]);
        let tag = u64::from_be_bytes(tag_bytes);
        let len = u32::from_be_bytes([
            image[cursor + 8],
            image[cursor + 9],
            image[cursor + 10],
            image[cursor + 11],
        ]) as usize;
        let start = cursor + nvram::RECORD_HEADER_LEN;
        if len > end - start {
            return Err(corrupted(format!("record {} overruns region", tag)));
        }
        let kept = len.min(nvram::MAX_PAYLOAD);
        entries.push(NvramEntry { tag, data: image[start..start + kept].to_vec() });
        cursor = start + len;
    }
    Ok(entries)
}

/// Encode entries into an image of exactly `capacity` bytes
pub fn encode(entries: &[NvramEntry], capacity: usize) -> Result<Vec<u8>> {
    if capacity < nvram::HEADER_LEN + nvram::CRC_LEN {
        return Err(ChassisError::NvramFull {
            needed: nvram::HEADER_LEN + nvram::CRC_LEN,
            capacity,
        });
    }
    let region_limit = (capacity - nvram::CRC_LEN).min(nvram::MAX_REGION);
    let needed = nvram::HEADER_LEN
        + entries
            .iter()
            .map(|e| nvram::RECORD_HEADER_LEN + e.data.len().min(nvram::MAX_PAYLOAD))
            .sum::<usize>();
    if needed > region_limit {
        return Err(ChassisError::NvramFull { needed: needed + nvram::CRC_LEN, capacity });
    }

    let mut image = Vec::with_capacity(capacity);
    image.extend_from_slice(&nvram::MAGIC);
    image.push(nvram::VERSION);
    image.extend_from_slice(&[0, 0]);
    for entry in entries {
        let data = &entry.data[..entry.data.len().min(nvram::MAX_PAYLOAD)];
        image.extend_from_slice(&entry.tag.to_be_bytes());
        image.extend_from_slice(&(data.len() as u32).to_be_bytes());
        image.extend_from_slice(data);
    }
    let end = image.len();
    image[5..7].copy_from_slice(&(end as u16).to_be_bytes());
    let crc = crc32_of(&image[..end]);
    image.extend_from_slice(&crc.to_be_bytes());
    image.resize(capacity, 0);
    Ok(image)
}

/// In-memory TLV cache bound to a device
pub struct Nvram {
    device: Box<dyn NvramDevice>,
    entries: Vec<NvramEntry>,
    initialized: bool,
    capacity: usize,
}

impl Nvram {
    pub fn new(device: Box<dyn NvramDevice>) -> Self {
        let capacity = device.size();
        Self { device, entries: Vec::new(), initialized: false, capacity }
    }

    /// Load the device image.
    ///
    /// The cache always ends up initialized. A blank device loads empty; a corrupt
    /// image also loads empty but is reported as an error.
    pub fn load(&mut self) -> Result<()> {
        self.entries.clear();
        self.initialized = true;
        let image = self.device.read()?;
        if !is_formatted(&image) {
            info!("NVRAM is blank, starting empty");
            return Ok(());
        }
        match decode(&image) {
            Ok(entries) => {
                debug!(entries = entries.len(), "NVRAM loaded");
                self.entries = entries;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "NVRAM image rejected, starting empty");
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[NvramEntry] {
        &self.entries
    }

    pub fn get(&self, tag: u64) -> Option<&[u8]> {
        self.entries.iter().find(|e| e.tag == tag).map(|e| e.data.as_slice())
    }

    /// Store, replace or (with `None`) delete a tag.
    ///
    /// Returns the notification for a committed mutation, or `None` when deleting a
    /// tag that does not exist. A failed encode or device write leaves the cache as
    /// it was.
    pub fn set(&mut self, tag: u64, data: Option<&[u8]>) -> Result<Option<Notification>> {
        if !self.initialized {
            return Err(ChassisError::NvramNotInitialized);
        }
        let data = data.map(|d| d[..d.len().min(nvram::MAX_PAYLOAD)].to_vec());

        let mut next = self.entries.clone();
        match (next.iter().position(|e| e.tag == tag), &data) {
            (Some(i), Some(d)) => next[i].data = d.clone(),
            (Some(i), None) => {
                next.remove(i);
            }
            (None, Some(d)) => next.push(NvramEntry { tag, data: d.clone() }),
            (None, None) => return Ok(None),
        }

        let image = encode(&next, self.capacity)?;
        self.device.write(&image)?;
        self.entries = next;
        debug!(tag, deleted = data.is_none(), "NVRAM updated");

        let view = NvramView { tag, data };
        Ok(Some(views::notification(ResourceClass::Nvram, &ResourceKey::nvram(tag), &view)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Device that keeps its image in memory and counts writes
    #[derive(Clone, Default)]
    struct MemDevice {
        image: Arc<Mutex<Vec<u8>>>,
        writes: Arc<Mutex<usize>>,
        fail_writes: bool,
    }

    impl MemDevice {
        fn with_size(size: usize) -> Self {
            Self { image: Arc::new(Mutex::new(vec![0; size])), ..Default::default() }
        }
    }

    impl NvramDevice for MemDevice {
        fn size(&self) -> usize {
            self.image.lock().len()
        }

        fn read(&mut self) -> Result<Vec<u8>> {
            Ok(self.image.lock().clone())
        }

        fn write(&mut self, image: &[u8]) -> Result<()> {
            if self.fail_writes {
                return Err(ChassisError::hardware("nvram write", "device busy"));
            }
            *self.image.lock() = image.to_vec();
            *self.writes.lock() += 1;
            Ok(())
        }
    }

    fn entry(tag: u64, data: &[u8]) -> NvramEntry {
        NvramEntry { tag, data: data.to_vec() }
    }

    #[test]
    fn test_layout_is_big_endian() {
        let image = encode(&[entry(0x0102, b"AB")], 64).unwrap();
        assert_eq!(&image[..4], b"TLV\0");
        assert_eq!(image[4], 1);
        // 7 header + 12 record header + 2 payload
        assert_eq!(&image[5..7], &[0, 21]);
        assert_eq!(&image[7..15], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&image[15..19], &[0, 0, 0, 2]);
        assert_eq!(&image[19..21], b"AB");
        assert_eq!(&image[21..25], &crc32_of(&image[..21]).to_be_bytes());
        assert_eq!(image.len(), 64);
    }

    #[test]
    fn test_decode_preserves_order() {
        let entries = vec![entry(9, b"nine"), entry(1, b""), entry(5, b"five")];
        let image = encode(&entries, 256).unwrap();
        assert_eq!(decode(&image).unwrap(), entries);
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut image = encode(&[entry(7, b"X")], 64).unwrap();
        image[20] ^= 0xff;
        assert!(matches!(decode(&image), Err(ChassisError::NvramCorrupted(_))));
    }

    #[test]
    fn test_region_past_capacity_rejected() {
        let mut image = encode(&[], 32).unwrap();
        image[5..7].copy_from_slice(&30u16.to_be_bytes());
        assert!(decode(&image).is_err());
    }

    /// Image with a single record whose length field exceeds the payload cap
    fn oversized_image(tag: u64, len: usize, capacity: usize) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(b"TLV\0");
        image.push(1);
        image.extend_from_slice(&[0, 0]);
        image.extend_from_slice(&tag.to_be_bytes());
        image.extend_from_slice(&(len as u32).to_be_bytes());
        image.extend_from_slice(&vec![0xaa; len]);
        let end = image.len();
        image[5..7].copy_from_slice(&(end as u16).to_be_bytes());
        let crc = crc32_of(&image[..end]);
        image.extend_from_slice(&crc.to_be_bytes());
        image.resize(capacity, 0);
        image
    }

    #[test]
    fn test_oversized_payload_truncated_on_decode() {
        let entries = decode(&oversized_image(3, 300, 1024)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data.len(), nvram::MAX_PAYLOAD);
    }

    #[test]
    fn test_reencode_of_oversized_record_is_capped() {
        let image = encode(&decode(&oversized_image(3, 300, 1024)).unwrap(), 1024).unwrap();

        let end = nvram::HEADER_LEN + nvram::RECORD_HEADER_LEN + nvram::MAX_PAYLOAD;
        assert_eq!(&image[5..7], &(end as u16).to_be_bytes());
        assert_eq!(&image[15..19], &(nvram::MAX_PAYLOAD as u32).to_be_bytes());
        assert_eq!(&image[end..end + 4], &crc32_of(&image[..end]).to_be_bytes());
        assert_eq!(image.len(), 1024);
        assert_eq!(decode(&image).unwrap(), vec![entry(3, &[0xaa; nvram::MAX_PAYLOAD])]);
    }

    #[test]
    fn test_encode_full() {
        let err = encode(&[entry(1, &[0; 100])], 64).unwrap_err();
        assert!(matches!(err, ChassisError::NvramFull { .. }));
    }

    #[test]
    fn test_set_then_delete_lifecycle() {
        let device = MemDevice::with_size(128);
        let mut store = Nvram::new(Box::new(device.clone()));
        store.load().unwrap();

        let n = store.set(7, Some(b"X".as_slice())).unwrap().expect("create notifies");
        assert_eq!(n.key, "nvram/7");
        assert_eq!(n.fields["tag"], 7);
        assert_eq!(store.entries().len(), 1);
        assert_eq!(*device.writes.lock(), 1);

        let n = store.set(7, None).unwrap().expect("delete notifies");
        assert!(n.fields["data"].is_null());
        assert!(store.get(7).is_none());
        assert_eq!(*device.writes.lock(), 2);

        // Deleting an absent tag is a no-op
        assert!(store.set(7, None).unwrap().is_none());
        assert_eq!(*device.writes.lock(), 2);
    }

    #[test]
    fn test_reload_sees_committed_entries() {
        let device = MemDevice::with_size(256);
        let mut store = Nvram::new(Box::new(device.clone()));
        store.load().unwrap();
        store.set(1, Some(b"one".as_slice())).unwrap();
        store.set(2, Some(b"two".as_slice())).unwrap();
        store.set(1, Some(b"uno".as_slice())).unwrap();

        let mut reloaded = Nvram::new(Box::new(device));
        reloaded.load().unwrap();
        assert_eq!(reloaded.entries(), &[entry(1, b"uno"), entry(2, b"two")]);
    }

    #[test]
    fn test_corrupt_device_loads_empty() {
        let device = MemDevice::with_size(128);
        let mut store = Nvram::new(Box::new(device.clone()));
        store.load().unwrap();
        store.set(7, Some(b"X".as_slice())).unwrap();
        device.image.lock()[8] ^= 0x55;

        let mut reloaded = Nvram::new(Box::new(device));
        assert!(reloaded.load().is_err());
        assert!(reloaded.is_initialized());
        assert!(reloaded.entries().is_empty());
    }

    #[test]
    fn test_failed_write_leaves_cache_unchanged() {
        let mut device = MemDevice::with_size(128);
        device.fail_writes = true;
        let mut store = Nvram::new(Box::new(device));
        store.load().unwrap();
        assert!(store.set(7, Some(b"X".as_slice())).is_err());
        assert!(store.get(7).is_none());
    }

    #[test]
    fn test_set_before_load_rejected() {
        let mut store = Nvram::new(Box::new(MemDevice::with_size(64)));
        assert!(matches!(
            store.set(1, Some(b"a".as_slice())),
            Err(ChassisError::NvramNotInitialized)
        ));
    }

    #[test]
    fn test_file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvram.bin");
        let mut store = Nvram::new(Box::new(FileNvram::open(&path, 512).unwrap()));
        store.load().unwrap();
        store.set(42, Some(b"persist".as_slice())).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 512);

        let mut reloaded = Nvram::new(Box::new(FileNvram::open(&path, 512).unwrap()));
        reloaded.load().unwrap();
        assert_eq!(reloaded.get(42), Some(&b"persist"[..]));
    }
}
