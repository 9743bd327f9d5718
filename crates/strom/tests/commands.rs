//! The numeric command interface.

use strom::command::{
    CheckFileCmd, DebugCmd, InfoGpuMemoryCmd, MapGpuMemoryCmd, MemcpySsdToGpuCmd, MemcpyWaitCmd,
    StromDmaChunk, UnmapGpuMemoryCmd,
};
use strom::{dispatch, Command, CommandCode, Error, Strom, StromConfig};
use strom_core::testing::{MockBlockDevice, MockEnv, MockFile};
use strom_core::{GpuPageSize, Pid, UnsupportedReason};

const CALLER: Pid = Pid(500);

fn setup() -> (MockEnv, Strom) {
    let mock = MockEnv::new(GpuPageSize::Size64K);
    let strom = Strom::new(StromConfig::default(), mock.env()).unwrap();
    (mock, strom)
}

fn map(strom: &Strom, vaddress: u64, length: u64) -> MapGpuMemoryCmd {
    let mut cmd = MapGpuMemoryCmd {
        vaddress,
        length,
        ..Default::default()
    };
    let rc = dispatch(strom, CALLER, 0x81, Command::MapGpuMemory(&mut cmd));
    assert_eq!(rc, 0);
    cmd
}

#[test]
fn test_map_info_unmap() {
    let (mock, strom) = setup();
    let mapped = map(&strom, 0x1_0000_8000, 0x1_0000);
    assert_ne!(mapped.handle, 0);
    assert_eq!(mapped.gpu_page_sz, 65536);
    assert_eq!(mapped.gpu_npages, 2);

    let mut info = InfoGpuMemoryCmd {
        handle: mapped.handle,
        nrooms: 1,
        ..Default::default()
    };
    let mut physical = [0u64; 4];
    let rc = dispatch(
        &strom,
        CALLER,
        CommandCode::InfoGpuMemory.raw(),
        Command::InfoGpuMemory {
            cmd: &mut info,
            physical: &mut physical,
        },
    );
    assert_eq!(rc, 0);
    assert_eq!(info.entries, 2);
    assert_eq!(info.page_size, 65536);
    assert_eq!(physical[0], mock.pager.page_phys(0).raw());
    assert_eq!(physical[1], 0);

    let unmap = UnmapGpuMemoryCmd {
        handle: mapped.handle,
    };
    assert_eq!(dispatch(&strom, CALLER, 0x82, Command::UnmapGpuMemory(&unmap)), 0);
    assert_eq!(
        dispatch(&strom, CALLER, 0x82, Command::UnmapGpuMemory(&unmap)),
        Error::NotFound.errno()
    );
    assert_eq!(strom.snapshot().len(), 0);
}

#[test]
fn test_memcpy_async_then_wait() {
    let (mock, strom) = setup();
    mock.add_file(3, MockFile::xfs(1 << 20));
    let mapped = map(&strom, 0x1_0000_0000, 0x2_0000);

    let chunks = [StromDmaChunk::file(0, 8192), StromDmaChunk::memory(0x7000_0000, 4096)];
    let mut cmd = MemcpySsdToGpuCmd {
        handle: mapped.handle,
        offset: 0,
        fdesc: 3,
        nchunks: 2,
        ..Default::default()
    };
    let rc = dispatch(
        &strom,
        CALLER,
        0x85,
        Command::MemcpySsdToGpuAsync {
            cmd: &mut cmd,
            chunks: &chunks,
        },
    );
    assert_eq!(rc, 0);
    assert_ne!(cmd.dma_task_id, 0);
    assert_eq!(mock.storage.requests().len(), 1);
    assert_eq!(mock.memory.requests().len(), 1);

    let wait = MemcpyWaitCmd {
        dma_task_id: cmd.dma_task_id,
    };
    assert_eq!(
        dispatch(&strom, CALLER, 0x86, Command::MemcpySsdToGpuWait(&wait)),
        Error::NotFound.errno()
    );
}

#[test]
fn test_memcpy_rejections() {
    let (mock, strom) = setup();
    mock.add_file(3, MockFile::ext4(1 << 20).with_block_size(2048));
    let mapped = map(&strom, 0x1_0000_0000, 0x1_0000);
    let chunks = [StromDmaChunk::file(0, 4096)];

    let mut cmd = MemcpySsdToGpuCmd {
        handle: mapped.handle,
        fdesc: 3,
        nchunks: 1,
        ..Default::default()
    };
    let rc = dispatch(
        &strom,
        CALLER,
        0x84,
        Command::MemcpySsdToGpu {
            cmd: &mut cmd,
            chunks: &chunks,
        },
    );
    assert_eq!(
        rc,
        Error::Unsupported(UnsupportedReason::BlockSizeMismatch(2048)).errno()
    );
    assert_eq!(cmd.dma_task_id, 0);

    cmd.fdesc = -1;
    let rc = dispatch(
        &strom,
        CALLER,
        0x84,
        Command::MemcpySsdToGpu {
            cmd: &mut cmd,
            chunks: &chunks,
        },
    );
    assert_eq!(rc, Error::BadDescriptor.errno());
    assert!(mock.submissions().is_empty());
}

#[test]
fn test_check_file_and_debug() {
    let (mock, strom) = setup();
    let sata = MockBlockDevice {
        major: 8,
        name: "sda".into(),
        identify: None,
    };
    mock.add_file(4, MockFile::ext4(1 << 20).with_resident([0]));
    mock.add_file(5, MockFile::ext4(1 << 20).with_device(sata));

    let eligible = CheckFileCmd { fdesc: 4 };
    let on_sata = CheckFileCmd { fdesc: 5 };
    let closed = CheckFileCmd { fdesc: 6 };
    assert_eq!(dispatch(&strom, CALLER, 0x80, Command::CheckFile(&eligible)), 0);
    assert_eq!(
        dispatch(&strom, CALLER, 0x80, Command::CheckFile(&on_sata)),
        Error::Unsupported(UnsupportedReason::NotExtendedDevice(8)).errno()
    );
    assert_eq!(
        dispatch(&strom, CALLER, 0x80, Command::CheckFile(&closed)),
        Error::BadDescriptor.errno()
    );

    let debug = DebugCmd {
        fdesc: 4,
        offset: 0,
        length: 3 * 4096,
        ..Default::default()
    };
    assert_eq!(dispatch(&strom, CALLER, 0x87, Command::Debug(&debug)), 0);
    assert_eq!(mock.host.live_pages(), 0);
}

#[test]
fn test_debug_whole_range_stops_at_file_end() {
    let (mock, strom) = setup();
    mock.add_file(4, MockFile::ext4(1 << 20).with_resident([0, 255]));

    let debug = DebugCmd {
        fdesc: 4,
        offset: 0,
        length: u64::MAX,
        ..Default::default()
    };
    assert_eq!(dispatch(&strom, CALLER, 0x87, Command::Debug(&debug)), 0);

    let past_end = DebugCmd {
        fdesc: 4,
        offset: u64::MAX - 4096,
        length: u64::MAX,
        ..Default::default()
    };
    assert_eq!(dispatch(&strom, CALLER, 0x87, Command::Debug(&past_end)), 0);
    assert_eq!(mock.host.live_pages(), 0);
}

#[test]
fn test_bad_codes() {
    let (_, strom) = setup();
    let cmd = CheckFileCmd { fdesc: 0 };
    assert_eq!(
        dispatch(&strom, CALLER, 0x90, Command::CheckFile(&cmd)),
        Error::InvalidArgument.errno()
    );
    assert_eq!(
        dispatch(&strom, CALLER, 0x81, Command::CheckFile(&cmd)),
        Error::InvalidArgument.errno()
    );
}
