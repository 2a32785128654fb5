//! Storage-device layer scenarios: registration, publication to devfs, and
//! request relaying between devfs and a driver.

use bytemuck::Zeroable;

use luxd::drivers::sdev::SdevServer;
use luxd::errors::Errno;
use luxd::ipc::message::{MessageHeader, Opcode};
use luxd::ipc::wire::{
    DevfsRegisterCommand, RWCommand, SDevRWCommand, SDevRegisterCommand, S_IFBLK, S_IFMT,
};
use luxd::ipc::{channel_pair, decode, encode, peek_header, put_str, ChannelEnd, Transport};

fn register_frame(device: u64, size: u64, sector_size: u16) -> Vec<u8> {
    let mut cmd = SDevRegisterCommand::zeroed();
    cmd.header = MessageHeader::request(Opcode::SdevRegister, 0);
    cmd.header.length = core::mem::size_of::<SDevRegisterCommand>() as u16;
    cmd.device = device;
    cmd.size = size;
    cmd.sector_size = sector_size;
    put_str(&mut cmd.server, "lux:///dside");
    encode(&cmd, &[])
}

fn rig() -> (SdevServer, ChannelEnd, ChannelEnd) {
    let (devfs_end, devfs) = channel_pair();
    let (driver_end, driver) = channel_pair();

    let mut sdev = SdevServer::new(Box::new(devfs_end));
    sdev.accept(Box::new(driver_end));

    (sdev, devfs, driver)
}

#[test]
fn registration_publishes_a_block_device() {
    let (mut sdev, mut devfs, mut driver) = rig();

    driver.send(&register_frame(0x42, 8192, 512)).unwrap();
    sdev.poll();

    assert_eq!(sdev.devices().len(), 1);
    assert_eq!(sdev.devices()[0].name, "/sd0");
    assert_eq!(sdev.devices()[0].device_id, 0x42);

    let frame = devfs.recv().expect("a devfs registration");
    let (reg, _) = decode::<DevfsRegisterCommand>(&frame).unwrap();
    assert_eq!(
        { reg.header.command },
        Opcode::DevfsRegister as u16
    );
    assert_eq!(luxd::ipc::get_str(&reg.path), "/sd0");
    assert_eq!({ reg.status.st_mode } & S_IFMT, S_IFBLK);
    assert_eq!({ reg.status.st_mode } & 0o777, 0o644);
    assert_eq!({ reg.status.st_size }, 8192 * 512);
    assert_eq!({ reg.status.st_blksize }, 512);
}

#[test]
fn read_is_relayed_in_sector_form_and_back() {
    let (mut sdev, mut devfs, mut driver) = rig();
    driver.send(&register_frame(0x42, 8192, 512)).unwrap();
    sdev.poll();
    devfs.recv().unwrap();

    // devfs forwards a byte-addressed read for /sd0
    let read = RWCommand::request(Opcode::Read, "/sd0", 1024, 512);
    devfs.send(&encode(&read, &[])).unwrap();
    sdev.poll();

    // the driver sees the sector-granular form with its own device id
    let frame = driver.recv().expect("a relayed request");
    let (mut relayed, _) = decode::<SDevRWCommand>(&frame).unwrap();
    assert_eq!({ relayed.header.command }, Opcode::SdevRead as u16);
    assert_eq!({ relayed.device }, 0x42);
    assert_eq!({ relayed.start }, 1024);
    assert_eq!({ relayed.count }, 512);
    assert_eq!({ relayed.sector_size }, 512);

    // the driver answers with the payload; sdev relays it to devfs
    relayed.header.into_response(core::mem::size_of::<SDevRWCommand>() + 512);
    relayed.header.status = 0;
    let payload = vec![0x7Eu8; 512];
    driver.send(&encode(&relayed, &payload)).unwrap();
    sdev.poll();

    let frame = devfs.recv().expect("the relayed response");
    let (response, data) = decode::<SDevRWCommand>(&frame).unwrap();
    assert_eq!({ response.header.status }, 0);
    assert_eq!(data, &payload[..]);
}

#[test]
fn unknown_index_answers_enodev() {
    let (mut sdev, mut devfs, _driver) = rig();

    let read = RWCommand::request(Opcode::Read, "/sd7", 0, 512);
    devfs.send(&encode(&read, &[])).unwrap();
    sdev.poll();

    let frame = devfs.recv().expect("an error response");
    assert_eq!(
        Errno::from_status(peek_header(&frame).unwrap().status),
        Some(Errno::ENODEV)
    );
}
