//! Demo binary wiring a `ThrottleEngine` together and driving a synthetic
//! bio workload through it — standing in for the real boot sequence this
//! crate would otherwise run under, the same way `slopos-mm`'s tests
//! exercise the allocator without a real MMU (§10.1).

use slopos_throttle::bio::{Bio, BioDirection};
use slopos_throttle::bucket::DEFAULT_SLICE_TICKS;
use slopos_throttle::config::ConfigFile;
use slopos_throttle::log::{self, Level};
use slopos_throttle::ThrottleEngine;

const DEVICE_A: u32 = 8;
const DEVICE_B: u32 = 9;
const GROUP: u32 = 1;
const FAKE_DEVICE: u32 = 7;

fn stdout_backend(args: core::fmt::Arguments<'_>, level: Level) {
    println!("[{:?}] {}", level, args);
}

fn main() {
    log::register_backend(stdout_backend);
    log::set_level(Level::Debug);

    let engine = ThrottleEngine::new();
    engine.register_device(DEVICE_A).expect("register device A");
    engine.register_device(DEVICE_B).expect("register device B");

    engine
        .write_config(GROUP, ConfigFile::ReadBpsDevice, "8:0 1048576", 0)
        .expect("configure read bps on device A");
    engine
        .write_config(GROUP, ConfigFile::HybridReadBpsDevice, "9:0 7 2097152", 0)
        .expect("configure fake device header on device B");

    let mut admitted = 0u32;
    let mut queued = 0u32;
    for i in 0..32 {
        let bio = Bio::new(GROUP, DEVICE_A, BioDirection::Read, 64 * 1024);
        match engine.throttle_bio(bio, 0) {
            Ok(true) => queued += 1,
            Ok(false) => admitted += 1,
            Err(err) => println!("bio {i} rejected: {err}"),
        }
    }
    println!("device A: {admitted} admitted immediately, {queued} queued");

    let released = engine
        .fire_timers(DEVICE_A, DEFAULT_SLICE_TICKS)
        .expect("fire timers on device A");
    println!(
        "device A: {} bios released once the slice renewed",
        released.len()
    );

    let fd_bio = Bio::new(GROUP, DEVICE_B, BioDirection::Read, 256 * 1024);
    let fd_queued = engine
        .throttle_bio(fd_bio, 0)
        .expect("throttle a bio against the fake device");
    println!("device B via fake device {FAKE_DEVICE}: queued = {fd_queued} (gate resolved internally from the group's hybrid config)");

    let drained = engine.drain(DEVICE_A).expect("drain device A");
    println!(
        "drained {} still-queued bios from device A during teardown",
        drained.len()
    );

    engine.exit(DEVICE_A).expect("exit device A");
    engine.exit(DEVICE_B).expect("exit device B");
}
