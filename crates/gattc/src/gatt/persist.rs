//! Attribute cache file storage
//!
//! A cache file is a `u16` record count followed by that many fixed-size
//! records, all little-endian:
//!
//! ```text
//! +--------+------------------+---------------------------+
//! | handle | type UUID (128b) | payload (148 bytes)       |
//! | 2      | 16               | 148                       |
//! +--------+------------------+---------------------------+
//! ```
//!
//! The type UUID selects the payload layout:
//!
//! | type        | payload                                           |
//! |-------------|---------------------------------------------------|
//! | 0x2800/2801 | end handle `u16`, service UUID                    |
//! | 0x2802      | start handle `u16`, end handle `u16`, UUID        |
//! | 0x2803      | value handle `u16`, properties `u8`, UUID         |
//! | other       | descriptor of that type, payload unused           |
//!
//! Records are written depth-first: each service, then its includes, then each
//! characteristic followed by its descriptors. Unused payload bytes are zero.

use crate::att::constants::{
    CHARACTERISTIC_UUID, INCLUDE_UUID, PRIMARY_SERVICE_UUID, SECONDARY_SERVICE_UUID,
};
use crate::gap::DeviceIdentity;
use crate::gatt::cache::AttributeCache;
use crate::gatt::types::{
    Characteristic, CharacteristicProperties, Descriptor, IncludeService, Service,
};
use crate::uuid::Uuid;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Size of the tagged payload of every record
pub const RECORD_PAYLOAD_SIZE: usize = 148;

/// Size of one record on disk
pub const RECORD_SIZE: usize = 2 + 16 + RECORD_PAYLOAD_SIZE;

/// Errors from reading or writing a cache file.
///
/// None of these are fatal to the client: a failed load means "no cache".
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cache file declares {declared} records but holds {read}")]
    Truncated { declared: u16, read: u16 },

    #[error("Malformed cache record at handle {handle:#06x}: {reason}")]
    Malformed { handle: u16, reason: &'static str },

    #[error("Too many records for a cache file: {0}")]
    TooManyRecords(usize),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
enum Record {
    Service(Service),
    Include(IncludeService),
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

impl Record {
    fn handle(&self) -> u16 {
        match self {
            Record::Service(s) => s.handle,
            Record::Include(i) => i.handle,
            Record::Characteristic(c) => c.handle,
            Record::Descriptor(d) => d.handle,
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut payload = Cursor::new([0u8; RECORD_PAYLOAD_SIZE]);
        let type_uuid = match self {
            Record::Service(s) => {
                payload.write_u16::<LittleEndian>(s.end_handle)?;
                payload.write_all(s.uuid.as_bytes_le())?;
                if s.is_primary {
                    Uuid::from_u16(PRIMARY_SERVICE_UUID)
                } else {
                    Uuid::from_u16(SECONDARY_SERVICE_UUID)
                }
            }
            Record::Include(i) => {
                payload.write_u16::<LittleEndian>(i.start_handle)?;
                payload.write_u16::<LittleEndian>(i.end_handle)?;
                payload.write_all(i.uuid.as_bytes_le())?;
                Uuid::from_u16(INCLUDE_UUID)
            }
            Record::Characteristic(c) => {
                payload.write_u16::<LittleEndian>(c.value_handle)?;
                payload.write_u8(c.properties.bits())?;
                payload.write_all(c.uuid.as_bytes_le())?;
                Uuid::from_u16(CHARACTERISTIC_UUID)
            }
            Record::Descriptor(d) => d.uuid,
        };

        w.write_u16::<LittleEndian>(self.handle())?;
        w.write_all(type_uuid.as_bytes_le())?;
        w.write_all(payload.get_ref())
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let handle = r.read_u16::<LittleEndian>()?;
        let type_uuid = read_uuid(r)?;
        let mut raw = [0u8; RECORD_PAYLOAD_SIZE];
        r.read_exact(&mut raw)?;
        let mut payload = Cursor::new(&raw[..]);

        let record = match type_uuid.as_u16() {
            Some(PRIMARY_SERVICE_UUID) | Some(SECONDARY_SERVICE_UUID) => {
                let end_handle = payload.read_u16::<LittleEndian>()?;
                let uuid = read_uuid(&mut payload)?;
                let is_primary = type_uuid == PRIMARY_SERVICE_UUID;
                Record::Service(Service::new(handle, end_handle, uuid, is_primary))
            }
            Some(INCLUDE_UUID) => {
                let start_handle = payload.read_u16::<LittleEndian>()?;
                let end_handle = payload.read_u16::<LittleEndian>()?;
                let uuid = read_uuid(&mut payload)?;
                Record::Include(IncludeService::new(handle, start_handle, end_handle, uuid))
            }
            Some(CHARACTERISTIC_UUID) => {
                let value_handle = payload.read_u16::<LittleEndian>()?;
                let properties = CharacteristicProperties::from_bits_retain(payload.read_u8()?);
                let uuid = read_uuid(&mut payload)?;
                Record::Characteristic(Characteristic::new(
                    handle,
                    value_handle,
                    properties,
                    uuid,
                ))
            }
            _ => Record::Descriptor(Descriptor::new(handle, type_uuid)),
        };
        Ok(record)
    }
}

fn read_uuid<R: Read>(r: &mut R) -> io::Result<Uuid> {
    let mut bytes = [0u8; 16];
    r.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes_le(bytes))
}

/// Flatten the cache into depth-first, parent-before-children records.
fn flatten(cache: &AttributeCache) -> Vec<Record> {
    let mut records = Vec::new();
    for service in cache.services() {
        records.push(Record::Service(Service::new(
            service.handle,
            service.end_handle,
            service.uuid,
            service.is_primary,
        )));
        records.extend(service.include_services.iter().copied().map(Record::Include));
        for characteristic in service.characteristics.values() {
            records.push(Record::Characteristic(Characteristic::new(
                characteristic.handle,
                characteristic.value_handle,
                characteristic.properties,
                characteristic.uuid,
            )));
            records.extend(
                characteristic
                    .descriptors
                    .values()
                    .copied()
                    .map(Record::Descriptor),
            );
        }
    }
    records
}

/// Serialize `cache` into `w`.
pub fn write_cache<W: Write>(cache: &AttributeCache, w: &mut W) -> CacheResult<()> {
    let records = flatten(cache);
    let count =
        u16::try_from(records.len()).map_err(|_| CacheError::TooManyRecords(records.len()))?;
    w.write_u16::<LittleEndian>(count)?;
    for record in &records {
        record.write_to(w)?;
    }
    Ok(())
}

/// Rebuild a cache by replaying records in file order.
///
/// Includes and characteristics attach to the most recent service record,
/// descriptors to the most recent characteristic record.
pub fn read_cache<R: Read>(r: &mut R) -> CacheResult<AttributeCache> {
    let declared = r.read_u16::<LittleEndian>()?;
    let mut cache = AttributeCache::new();
    let mut current_service: Option<u16> = None;
    let mut current_characteristic: Option<u16> = None;

    for read in 0..declared {
        let record = match Record::read_from(r) {
            Ok(record) => record,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CacheError::Truncated { declared, read });
            }
            Err(e) => return Err(e.into()),
        };

        let handle = record.handle();
        let orphan = |reason| CacheError::Malformed { handle, reason };
        match record {
            Record::Service(service) => {
                current_service = Some(service.handle);
                current_characteristic = None;
                cache.add_service(service);
            }
            Record::Include(include) => {
                let service = current_service.ok_or(orphan("include before any service"))?;
                cache
                    .add_include_service(service, include)
                    .map_err(|_| orphan("include parent missing"))?;
            }
            Record::Characteristic(characteristic) => {
                let service =
                    current_service.ok_or(orphan("characteristic before any service"))?;
                current_characteristic = Some(characteristic.handle);
                cache
                    .add_characteristic(service, characteristic)
                    .map_err(|_| orphan("characteristic parent missing"))?;
            }
            Record::Descriptor(descriptor) => {
                let characteristic = current_characteristic
                    .ok_or(orphan("descriptor before any characteristic"))?;
                cache
                    .add_descriptor(characteristic, descriptor)
                    .map_err(|_| orphan("descriptor parent missing"))?;
            }
        }
    }

    Ok(cache)
}

/// Per-device cache files under a common path prefix
#[derive(Debug, Clone)]
pub struct CacheStore {
    prefix: String,
}

impl CacheStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `<prefix><address>_<CLASSIC|LE>`
    pub fn path_for(&self, device: &DeviceIdentity) -> PathBuf {
        PathBuf::from(format!(
            "{}{}_{}",
            self.prefix,
            device.address,
            device.transport.tag()
        ))
    }

    /// Write the cache file for `device`, replacing any previous one.
    pub fn store(&self, device: &DeviceIdentity, cache: &AttributeCache) -> CacheResult<()> {
        let path = self.path_for(device);
        let mut buf = Vec::with_capacity(2 + cache.len() * RECORD_SIZE);
        write_cache(cache, &mut buf)?;

        let tmp = temp_path(&path);
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &path)?;
        debug!(
            "Stored {} bytes of attribute cache for {} at {}",
            buf.len(),
            device,
            path.display()
        );
        Ok(())
    }

    /// Read the cache file for `device`.
    pub fn load(&self, device: &DeviceIdentity) -> CacheResult<AttributeCache> {
        let path = self.path_for(device);
        let bytes = fs::read(&path)?;
        let cache = read_cache(&mut Cursor::new(bytes))?;
        debug!(
            "Loaded {} services for {} from {}",
            cache.len(),
            device,
            path.display()
        );
        Ok(cache)
    }

    /// Delete the cache file for `device`, if any.
    pub fn remove(&self, device: &DeviceIdentity) {
        let path = self.path_for(device);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove cache file {}: {}", path.display(), e);
            }
        }
    }
}

/// `<path>.tmp`, keeping any dots already in the file name
fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::BdAddr;
    use std::collections::BTreeSet;

    fn sample_cache() -> AttributeCache {
        let mut cache = AttributeCache::new();
        cache.add_service(Service::new(1, 7, Uuid::from_u16(0x1800), true));
        cache
            .add_characteristic(
                1,
                Characteristic::new(2, 3, CharacteristicProperties::READ, Uuid::from_u16(0x2A00)),
            )
            .unwrap();
        cache
            .add_characteristic(
                1,
                Characteristic::new(4, 5, CharacteristicProperties::READ, Uuid::from_u16(0x2A01)),
            )
            .unwrap();

        let custom: Uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
        cache.add_service(Service::new(8, 20, custom, true));
        cache
            .add_include_service(8, IncludeService::new(9, 21, 25, Uuid::from_u16(0x180F)))
            .unwrap();
        cache
            .add_characteristic(
                8,
                Characteristic::new(
                    10,
                    11,
                    CharacteristicProperties::NOTIFY | CharacteristicProperties::WRITE,
                    custom,
                ),
            )
            .unwrap();
        cache
            .add_descriptor(10, Descriptor::new(12, Uuid::from_u16(0x2902)))
            .unwrap();
        cache
            .add_descriptor(10, Descriptor::new(13, Uuid::from_u16(0x2901)))
            .unwrap();

        cache.add_service(Service::new(21, 25, Uuid::from_u16(0x180F), false));
        cache
            .add_characteristic(
                21,
                Characteristic::new(22, 23, CharacteristicProperties::READ, Uuid::from_u16(0x2A19)),
            )
            .unwrap();
        cache
    }

    fn flat_set(cache: &AttributeCache) -> BTreeSet<String> {
        flatten(cache).iter().map(|r| format!("{:?}", r)).collect()
    }

    #[test]
    fn test_record_layout() {
        let mut cache = AttributeCache::new();
        cache.add_service(Service::new(0x0010, 0x0020, Uuid::from_u16(0x180D), true));
        let mut buf = Vec::new();
        write_cache(&cache, &mut buf).unwrap();

        assert_eq!(buf.len(), 2 + RECORD_SIZE);
        assert_eq!(&buf[0..2], &[1, 0]);
        assert_eq!(&buf[2..4], &[0x10, 0x00]);
        assert_eq!(&buf[4..20], Uuid::from_u16(PRIMARY_SERVICE_UUID).as_bytes_le());
        assert_eq!(&buf[20..22], &[0x20, 0x00]);
        assert_eq!(&buf[22..38], Uuid::from_u16(0x180D).as_bytes_le());
        assert!(buf[38..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_depth_first_order() {
        let kinds: Vec<(u16, &str)> = flatten(&sample_cache())
            .iter()
            .map(|r| {
                let kind = match r {
                    Record::Service(_) => "service",
                    Record::Include(_) => "include",
                    Record::Characteristic(_) => "characteristic",
                    Record::Descriptor(_) => "descriptor",
                };
                (r.handle(), kind)
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (1, "service"),
                (2, "characteristic"),
                (4, "characteristic"),
                (8, "service"),
                (9, "include"),
                (10, "characteristic"),
                (12, "descriptor"),
                (13, "descriptor"),
                (21, "service"),
                (22, "characteristic"),
            ]
        );
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/gatt_", dir.path().display());
        let store = CacheStore::new(prefix);
        let device = DeviceIdentity::le(BdAddr::new([0x55, 0x44, 0x33, 0x22, 0x11, 0x00]));

        let original = sample_cache();
        store.store(&device, &original).unwrap();
        assert!(dir.path().join("gatt_00:11:22:33:44:55_LE").exists());

        let loaded = store.load(&device).unwrap();
        assert_eq!(flat_set(&loaded), flat_set(&original));
        assert_eq!(loaded.snapshot(), original.snapshot());
        assert!(!loaded.service(21).unwrap().is_primary);
        assert_eq!(loaded.descriptor(13).map(|d| d.uuid), Some(Uuid::from_u16(0x2901)));
        assert_eq!(loaded.characteristic_by_value_handle(11).map(|c| c.handle), Some(10));
    }

    #[test]
    fn test_transports_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(format!("{}/", dir.path().display()));
        let addr = BdAddr::new([1, 2, 3, 4, 5, 6]);

        store.store(&DeviceIdentity::le(addr), &sample_cache()).unwrap();
        assert_ne!(
            store.path_for(&DeviceIdentity::le(addr)),
            store.path_for(&DeviceIdentity::classic(addr))
        );
        assert!(matches!(
            store.load(&DeviceIdentity::classic(addr)),
            Err(CacheError::Io(_))
        ));

        store.remove(&DeviceIdentity::le(addr));
        assert!(store.load(&DeviceIdentity::le(addr)).is_err());
    }

    #[test]
    fn test_dotted_prefix_keeps_per_device_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(format!("{}/gatt.cache_", dir.path().display()));
        let device = DeviceIdentity::le(BdAddr::new([1, 2, 3, 4, 5, 6]));
        let path = store.path_for(&device);

        let tmp = temp_path(&path);
        assert_eq!(tmp.parent(), path.parent());
        assert_eq!(
            tmp.file_name().unwrap().to_str().unwrap(),
            format!("gatt.cache_{}_LE.tmp", device.address)
        );

        // Another process's file that a truncated temp name would clobber
        let bystander = dir.path().join("gatt.tmp");
        std::fs::write(&bystander, b"keep").unwrap();
        store.store(&device, &sample_cache()).unwrap();
        assert_eq!(std::fs::read(&bystander).unwrap(), b"keep");
        assert!(!tmp.exists());
        assert_eq!(flat_set(&store.load(&device).unwrap()), flat_set(&sample_cache()));
    }

    #[test]
    fn test_truncated_file() {
        let mut buf = Vec::new();
        write_cache(&sample_cache(), &mut buf).unwrap();
        buf.truncate(2 + 3 * RECORD_SIZE + 10);

        match read_cache(&mut Cursor::new(buf)) {
            Err(CacheError::Truncated { declared, read }) => {
                assert_eq!(declared, 10);
                assert_eq!(read, 3);
            }
            other => panic!("unexpected result: {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn test_orphan_descriptor_is_malformed() {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(1).unwrap();
        Record::Descriptor(Descriptor::new(5, Uuid::from_u16(0x2902)))
            .write_to(&mut buf)
            .unwrap();

        assert!(matches!(
            read_cache(&mut Cursor::new(buf)),
            Err(CacheError::Malformed { handle: 5, .. })
        ));
    }
}
