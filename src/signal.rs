use std::sync::atomic::{AtomicBool, Ordering};

use log::error;
use nix::{
    libc::c_int,
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

// NOTE: only async-signal-safe work in here, so no flushing
extern "C" fn sig_handler(_signal: c_int) {
    if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        // second signal: the user gave up on a graceful shutdown
        unsafe { nix::libc::_exit(130) };
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

pub fn setup_sig_handler() -> nix::Result<()> {
    let sig_act = SigAction::new(
        SigHandler::Handler(sig_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        if let Err(e) = unsafe { sigaction(signal, &sig_act) } {
            error!(signal = signal.as_str(), errno = format!("{}", e).as_str(); "Could not set up signal handler");
            return Err(e);
        }
    }
    Ok(())
}
