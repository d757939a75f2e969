//! Minimal demo binary, analogous to `libkrun`'s own `main.rs` smoke test:
//! hydrate a rootfs tar, load the configured binary, and print where guest
//! execution would begin. There is no RISC-V instruction interpreter in this
//! crate (the `Machine` trait is implemented by the embedder), so this
//! cannot actually run guest code — it exercises the VFS/loader/stack wiring
//! end to end and stops there.

use std::fs;

use anyhow::Context;
use friscy::{GuestConfig, GuestState};
use friscy_core::machine::Machine;
use friscy_testkit::FlatMachine;

fn main() -> anyhow::Result<()> {
    friscy::init_logger_once();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().context("usage: friscy <config.json> <rootfs.tar>")?;
    let rootfs_path = args.next().context("usage: friscy <config.json> <rootfs.tar>")?;

    let config_json = fs::read_to_string(&config_path)
        .with_context(|| format!("reading {config_path:?}"))?;
    let config = GuestConfig::from_json(&config_json).context("parsing guest config")?;
    let rootfs_tar = fs::read(&rootfs_path).with_context(|| format!("reading {rootfs_path:?}"))?;

    let mut machine = FlatMachine::new(64 * 1024 * 1024);
    let guest = GuestState::new(config, &rootfs_tar, &mut machine).context("booting guest")?;

    tracing::info!(
        entry = format_args!("{:#x}", machine.pc()),
        sp = format_args!("{:#x}", machine.reg(2)),
        dynamic = guest.exec.dynamic,
        "guest image loaded"
    );
    Ok(())
}
