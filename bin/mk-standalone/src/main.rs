// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::{Arc, MutexGuard, PoisonError};

use anyhow::{bail, Context};
use clap::Parser;
use slog::{info, o, Drain};

use bf_syscall::{BfSyscall, BfSyscallOps};
use bf_types::consts::BF_ALL_SPECS_SUPPORTED_VAL;
use bf_types::{BfReg, PpId, TlsReg};
use microkernel::config::{self, Config};
use microkernel::loopback::{Loopback, Platform, SharedPlatform};
use microkernel::Dispatch;

mod extension;

use extension::{DefaultExtension, EXIT_REASON_CPUID};

/// Length of the `cpuid` instruction.
const CPUID_INSN_LEN: u64 = 2;

/// Where the staged guest is stopped when the first exit is injected.
const GUEST_RIP: u64 = 0x7C00;

type Extension = DefaultExtension<BfSyscall<Loopback>>;

fn build_log(level: slog::Level) -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn lock(platform: &SharedPlatform) -> MutexGuard<'_, Platform> {
    platform.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Make sure the last syscall on `ppid` left it in the guest.
fn expect_running(platform: &SharedPlatform, ppid: PpId) -> anyhow::Result<()> {
    match lock(platform).last_outcome(ppid) {
        Some(Dispatch::Run) => Ok(()),
        other => bail!("pp {ppid} is not running a guest: {other:?}"),
    }
}

/// Start the extension on the BSP, then bring every PP into the root VM.
fn start(platform: &SharedPlatform, ext: &mut Extension) -> anyhow::Result<()> {
    ext.main(BF_ALL_SPECS_SUPPORTED_VAL)
        .context("extension failed to start")?;
    lock(platform).finish_start().context("failed to start the APs")?;

    let online_pps = lock(platform).online_pps();
    for pp in 0..online_pps {
        let ppid = PpId::new(pp);
        ext.sys_mut().abi_mut().select_pp(ppid);
        ext.bootstrap_entry(ppid);
        expect_running(platform, ppid)?;
    }
    Ok(())
}

/// Stage a CPUID exit of the root VS on `ppid` and let the extension
/// handle it.
fn inject_cpuid(
    platform: &SharedPlatform,
    ext: &mut Extension,
    ppid: PpId,
    leaf: u64,
) -> anyhow::Result<()> {
    ext.sys_mut().abi_mut().select_pp(ppid);
    let vsid = ext.sys().bf_tls_vsid();
    {
        let mut platform = lock(platform);
        platform.write_vs_reg(
            ppid,
            vsid,
            BfReg::VmexitInstructionLength,
            CPUID_INSN_LEN,
        )?;
    }
    ext.sys_mut().set_tls_reg(TlsReg::Rax, leaf);
    ext.sys_mut().set_tls_reg(TlsReg::Rcx, 0);

    ext.vmexit_entry(vsid, EXIT_REASON_CPUID);
    expect_running(platform, ppid)
}

fn report(log: &slog::Logger, platform: &SharedPlatform) -> anyhow::Result<()> {
    let mut platform = lock(platform);
    for pp in 0..platform.online_pps() {
        let ppid = PpId::new(pp);
        let Some(tls) = platform.tls(ppid) else {
            continue;
        };
        let (vmid, vpid, vsid) =
            (tls.active_vmid, tls.active_vpid, tls.active_vsid);
        let rip = platform.read_vs_reg(ppid, vsid, BfReg::GuestRip)?;
        info!(log, "pp state";
            "ppid" => pp,
            "vmid" => vmid.get(),
            "vpid" => vpid.get(),
            "vsid" => vsid.get(),
            "guest_rip" => format!("{rip:#x}"),
        );
    }

    let mk = platform.microkernel();
    info!(log, "memory";
        "pages_allocated" => mk.page_pool.allocated(),
        "pages_remaining" => mk.page_pool.remaining(),
        "huge_pages_remaining" => mk.huge_pool.remaining_pages(),
    );
    Ok(())
}

#[derive(clap::Parser)]
/// Boot a microkernel model in-process and run the default extension on
/// every PP.
struct Args {
    /// Microkernel config file. Built-in defaults are used when omitted.
    #[clap(value_name = "CONFIG", action)]
    config: Option<PathBuf>,

    /// Number of PPs to bring online, overriding the config file.
    #[clap(short = 'p', long, env = "MK_ONLINE_PPS", action)]
    online_pps: Option<u16>,

    /// CPUID exits to inject on each PP once it is running.
    #[clap(short, long, default_value_t = 1, action)]
    exits: u32,
}

fn main() -> anyhow::Result<()> {
    let Args { config, online_pps, exits } = Args::parse();

    let mut config = match config {
        Some(path) => config::parse(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(online_pps) = online_pps {
        config.online_pps = online_pps;
    }
    config.validate()?;

    let (log, _log_async_guard) = build_log(config.log_level()?);

    let platform = Platform::new(&log, &config)
        .context("failed to start the microkernel")?
        .shared();
    let abi = Loopback::new(Arc::clone(&platform), PpId::BS);
    let sys = BfSyscall::new(&log, abi);
    let mut ext = DefaultExtension::new(&log, sys, extension::host_cpuid);

    start(&platform, &mut ext)?;
    info!(log, "root os demoted"; "online_pps" => config.online_pps);

    for pp in 0..config.online_pps {
        let ppid = PpId::new(pp);
        ext.sys_mut().abi_mut().select_pp(ppid);
        let vsid = ext.sys().bf_tls_vsid();
        lock(&platform).write_vs_reg(ppid, vsid, BfReg::GuestRip, GUEST_RIP)?;
        for leaf in 0..exits {
            inject_cpuid(&platform, &mut ext, ppid, leaf.into())?;
        }
    }

    report(&log, &platform)?;
    ext.sys_mut().release();
    Ok(())
}
