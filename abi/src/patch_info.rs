/// Length of the near jump written over each patched function entry.
pub const NEAR_JMP_LEN: usize = 5;

pub const PATCH_INFO_NEW_FUNC: u32 = 1 << 0;
/// Runtime-local marker, never written back to the blob.
pub const PATCH_INFO_APPLIED: u32 = 1 << 31;

const PERSISTED_FLAGS: u32 = !PATCH_INFO_APPLIED;

/// One function-level redirection inside a patch blob.
///
/// The in-blob array is terminated by an all-zero sentinel record. A "new
/// function" record carries only `saddr`/`slen` and never produces a hunk.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchInfo {
    pub daddr: u64,
    pub dlen: u64,
    pub saddr: u64,
    pub slen: u64,
    pub flags: u32,
    pub reserved: u32,
}

pub const PATCH_INFO_LEN: usize = std::mem::size_of::<PatchInfo>();

impl PatchInfo {
    pub fn from_bytes(data: &[u8]) -> Self {
        let u64_at = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&data[32..36]);

        Self {
            daddr: u64_at(0),
            dlen: u64_at(8),
            saddr: u64_at(16),
            slen: u64_at(24),
            flags: u32::from_le_bytes(flags) & PERSISTED_FLAGS,
            reserved: 0,
        }
    }

    pub fn write_to(&self, data: &mut [u8]) {
        data[0..8].copy_from_slice(&self.daddr.to_le_bytes());
        data[8..16].copy_from_slice(&self.dlen.to_le_bytes());
        data[16..24].copy_from_slice(&self.saddr.to_le_bytes());
        data[24..32].copy_from_slice(&self.slen.to_le_bytes());
        data[32..36].copy_from_slice(&(self.flags & PERSISTED_FLAGS).to_le_bytes());
        data[36..40].copy_from_slice(&0u32.to_le_bytes());
    }

    pub fn is_end(&self) -> bool {
        self.daddr == 0 && self.dlen == 0 && self.saddr == 0 && self.slen == 0
    }

    pub fn is_new_func(&self) -> bool {
        self.flags & PATCH_INFO_NEW_FUNC != 0
    }

    pub fn is_applied(&self) -> bool {
        self.flags & PATCH_INFO_APPLIED != 0
    }

    pub fn set_applied(&mut self) {
        self.flags |= PATCH_INFO_APPLIED;
    }
}

/// Encodes `E9 <disp32>` redirecting `from` to `to`, or `None` when the
/// displacement does not fit a signed 32-bit offset.
pub fn near_jmp(from: u64, to: u64) -> Option<[u8; NEAR_JMP_LEN]> {
    let disp = (to as i64)
        .wrapping_sub(from as i64)
        .wrapping_sub(NEAR_JMP_LEN as i64);
    if disp > i64::from(i32::MAX) || disp < i64::from(i32::MIN) {
        return None;
    }

    let mut code = [0u8; NEAR_JMP_LEN];
    code[0] = 0xe9;
    code[1..].copy_from_slice(&(disp as i32).to_le_bytes());
    Some(code)
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use super::*;

    #[test]
    fn record_round_trip_drops_local_flags() {
        let mut info = PatchInfo {
            daddr: 0x400100,
            dlen: 16,
            saddr: 0x500200,
            slen: 32,
            flags: 0,
            reserved: 0,
        };
        info.set_applied();
        assert!(info.is_applied());

        let mut raw = [0u8; PATCH_INFO_LEN];
        info.write_to(&mut raw);
        let decoded = PatchInfo::from_bytes(&raw);

        assert!(!decoded.is_applied());
        assert_eq!(decoded.daddr, info.daddr);
        assert_eq!(decoded.saddr, info.saddr);
        assert_eq!(decoded.slen, info.slen);
    }

    #[test]
    fn sentinel_and_new_func_predicates() {
        assert!(PatchInfo::default().is_end());

        let new_func = PatchInfo {
            saddr: 0x500200,
            slen: 64,
            flags: PATCH_INFO_NEW_FUNC,
            ..Default::default()
        };
        assert!(!new_func.is_end());
        assert!(new_func.is_new_func());
    }

    #[test]
    fn near_jmp_encoding() {
        // Forward jump: disp = 0x500200 - 0x400100 - 5 = 0x1000fb.
        let code = near_jmp(0x400100, 0x500200).unwrap();
        assert_eq!(code, [0xe9, 0xfb, 0x00, 0x10, 0x00]);

        // Backward jump stays encodable.
        let code = near_jmp(0x500200, 0x400100).unwrap();
        assert_eq!(code[0], 0xe9);
        assert_eq!(i32::from_le_bytes(code[1..].try_into().unwrap()), -0x10_0105);

        // Out of 32-bit reach.
        assert!(near_jmp(0x400100, 0x7f00_0000_0100).is_none());
    }
}
