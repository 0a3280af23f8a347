use nix::unistd::Uid;

#[inline]
pub fn id() -> u32 {
    Uid::effective().as_raw()
}
