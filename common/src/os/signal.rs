use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};

pub use nix::sys::signal::Signal;
pub use nix::sys::signal::Signal::{SIGINT, SIGTERM};

/// Blocks delivery of `signals` to the calling process.
pub fn block(signals: &[Signal]) -> std::io::Result<()> {
    let mut mask = SigSet::empty();
    for signal in signals {
        mask.add(*signal);
    }

    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}
