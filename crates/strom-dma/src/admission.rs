//! # Admission Check
//!
//! Decides whether a file may take the direct NVMe-to-GPU path.
//!
//! The checks run in a fixed order and the first failure is reported:
//!
//! | # | Condition                                   | Reason                    |
//! |---|---------------------------------------------|---------------------------|
//! | 1 | opened for reading                          | `NoReadPermission`        |
//! | 2 | ext4 or xfs (magic, name and owning module) | `FilesystemNotSupported`  |
//! | 3 | size >= host page                           | `FileTooSmall`            |
//! | 4 | block size == host page                     | `BlockSizeMismatch`       |
//! | 5 | device major is the extended-devt major     | `NotExtendedDevice`       |
//! | 6 | disk name is `nvme<N>n<M>`                  | `DeviceNotNvme`           |
//! | 7 | identify operation present                  | `NoIdentifyOperation`     |
//! | 8 | identify operation succeeds                 | `IdentifyFailed`          |

use strom_core::{
    BlockMapper, Error, FileMode, FsIdentity, FsKind, Result, SourceFile, UnsupportedReason,
};

/// Major number of block devices with extended dev_t (NVMe namespaces)
pub const BLOCK_EXT_MAJOR: u32 = 259;

/// Run the admission check against `file`
pub fn check_file(file: &dyn SourceFile, page_size: u64, blocks: &dyn BlockMapper) -> Result<()> {
    classify(file, page_size, blocks).map(|_| ()).map_err(|reason| {
        log::warn!("strom: file not eligible for direct transfer: {}", reason);
        Error::Unsupported(reason)
    })
}

/// Filesystem of an eligible file, or the first failing reason
pub fn classify(
    file: &dyn SourceFile,
    page_size: u64,
    blocks: &dyn BlockMapper,
) -> core::result::Result<FsKind, UnsupportedReason> {
    if !file.mode().contains(FileMode::READ) {
        return Err(UnsupportedReason::NoReadPermission);
    }

    let fs = file.filesystem();
    let kind = FsKind::ALL
        .into_iter()
        .find(|&kind| is_filesystem(&fs, kind, blocks))
        .ok_or(UnsupportedReason::FilesystemNotSupported)?;

    let size = file.size();
    if size < page_size {
        return Err(UnsupportedReason::FileTooSmall(size));
    }
    let block_size = file.block_size();
    if block_size != page_size {
        return Err(UnsupportedReason::BlockSizeMismatch(block_size));
    }

    let device = file.block_device();
    if device.major() != BLOCK_EXT_MAJOR {
        return Err(UnsupportedReason::NotExtendedDevice(device.major()));
    }
    if !is_nvme_namespace(device.disk_name()) {
        return Err(UnsupportedReason::DeviceNotNvme);
    }
    if !device.supports_identify() {
        return Err(UnsupportedReason::NoIdentifyOperation);
    }
    device.identify().map_err(UnsupportedReason::IdentifyFailed)?;

    Ok(kind)
}

fn is_filesystem(fs: &FsIdentity, kind: FsKind, blocks: &dyn BlockMapper) -> bool {
    fs.magic == kind.magic()
        && fs.name == kind.name()
        && fs.owner.is_some()
        && fs.owner == blocks.provider(kind)
}

/// Whether `name` has the exact shape `nvme<digits>n<digits>`
///
/// Partitions (`nvme0n1p1`) and multipath or RAID names are rejected.
pub fn is_nvme_namespace(name: &str) -> bool {
    fn digits(s: &str) -> Option<&str> {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        (end > 0).then(|| &s[end..])
    }

    name.strip_prefix("nvme")
        .and_then(digits)
        .and_then(|rest| rest.strip_prefix('n'))
        .and_then(digits)
        .is_some_and(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strom_core::testing::{MockBlockDevice, MockBlockMapper, MockFile, EXT4_MODULE};
    use strom_core::ModuleId;

    const PAGE: u64 = 4096;

    fn check(file: &MockFile) -> core::result::Result<FsKind, UnsupportedReason> {
        classify(file, PAGE, &MockBlockMapper::new())
    }

    #[test]
    fn test_nvme_names() {
        assert!(is_nvme_namespace("nvme0n1"));
        assert!(is_nvme_namespace("nvme12n345"));
        assert!(!is_nvme_namespace("nvme0n1p1"));
        assert!(!is_nvme_namespace("nvme0"));
        assert!(!is_nvme_namespace("nvmen1"));
        assert!(!is_nvme_namespace("nvme0n"));
        assert!(!is_nvme_namespace("md0"));
        assert!(!is_nvme_namespace("sda"));
    }

    #[test]
    fn test_eligible_files() {
        assert_eq!(check(&MockFile::ext4(1 << 20)), Ok(FsKind::Ext4));
        assert_eq!(check(&MockFile::xfs(PAGE)), Ok(FsKind::Xfs));
    }

    #[test]
    fn test_read_permission_first() {
        let file = MockFile::ext4(0).with_mode(FileMode::WRITE).with_block_size(512);
        assert_eq!(check(&file), Err(UnsupportedReason::NoReadPermission));
    }

    #[test]
    fn test_lookalike_filesystem_rejected() {
        let file = MockFile::ext4(1 << 20).with_filesystem(FsIdentity {
            magic: 0xEF53,
            name: "ext4".into(),
            owner: Some(ModuleId(0xBAD)),
        });
        assert_eq!(check(&file), Err(UnsupportedReason::FilesystemNotSupported));

        let file = MockFile::ext4(1 << 20).with_filesystem(FsIdentity {
            magic: 0xEF53,
            name: "ext3".into(),
            owner: Some(EXT4_MODULE),
        });
        assert_eq!(check(&file), Err(UnsupportedReason::FilesystemNotSupported));
    }

    #[test]
    fn test_unloaded_provider_rejected() {
        let blocks = MockBlockMapper::new();
        blocks.unload(FsKind::Ext4);
        let result = classify(&MockFile::ext4(1 << 20), PAGE, &blocks);
        assert_eq!(result, Err(UnsupportedReason::FilesystemNotSupported));
        assert!(classify(&MockFile::xfs(1 << 20), PAGE, &blocks).is_ok());
    }

    #[test]
    fn test_size_and_block_size() {
        assert_eq!(check(&MockFile::ext4(100)), Err(UnsupportedReason::FileTooSmall(100)));
        let file = MockFile::ext4(1 << 20).with_block_size(1024);
        assert_eq!(check(&file), Err(UnsupportedReason::BlockSizeMismatch(1024)));
    }

    #[test]
    fn test_device_checks_in_order() {
        let mut device = MockBlockDevice::nvme("md0");
        device.major = 9;
        let file = MockFile::ext4(1 << 20).with_device(device);
        assert_eq!(check(&file), Err(UnsupportedReason::NotExtendedDevice(9)));

        let file = MockFile::ext4(1 << 20).with_device(MockBlockDevice::nvme("nvme0n1p2"));
        assert_eq!(check(&file), Err(UnsupportedReason::DeviceNotNvme));

        let mut device = MockBlockDevice::nvme("nvme1n1");
        device.identify = None;
        let file = MockFile::ext4(1 << 20).with_device(device);
        assert_eq!(check(&file), Err(UnsupportedReason::NoIdentifyOperation));

        let mut device = MockBlockDevice::nvme("nvme1n1");
        device.identify = Some(Err(-5));
        let file = MockFile::ext4(1 << 20).with_device(device);
        assert_eq!(check(&file), Err(UnsupportedReason::IdentifyFailed(-5)));
    }

    #[test]
    fn test_check_file_maps_to_error() {
        let file = MockFile::ext4(10);
        let result = check_file(&file, PAGE, &MockBlockMapper::new());
        assert_eq!(result, Err(Error::Unsupported(UnsupportedReason::FileTooSmall(10))));
    }
}
