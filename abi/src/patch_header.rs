use memoffset::offset_of;

pub const KPATCH_MAGIC: [u8; 8] = *b"KPATCH1\0";
pub const KPATCH_UNAME_LEN: usize = 64;

/// Blob header, always little-endian.
///
/// `user_info`, `user_undo` and `jmp_offset` are zero in storage and are
/// stamped by the installer before the blob is written into the target.
#[repr(C)]
pub struct KpatchHeader {
    pub magic: [u8; 8],
    pub uname: [u8; KPATCH_UNAME_LEN],
    pub user_level: u64,
    pub kpatch_offset: u64,
    pub total_size: u64,
    pub jmp_offset: u64,
    pub user_info: u64,
    pub user_undo: u64,
}

pub const KPATCH_HEADER_LEN: usize = std::mem::size_of::<KpatchHeader>();

pub trait OperateRead {
    fn data(&self) -> &[u8];

    fn get_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data()[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }
}

pub trait OperateWrite {
    fn data_mut(&mut self) -> &mut [u8];

    fn set_u64(&mut self, offset: usize, value: u64) {
        self.data_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl OperateRead for [u8] {
    fn data(&self) -> &[u8] {
        self
    }
}

impl OperateWrite for [u8] {
    fn data_mut(&mut self) -> &mut [u8] {
        self
    }
}

pub trait HeaderRead: OperateRead {
    fn magic(&self) -> &[u8] {
        &self.data()[..KPATCH_MAGIC.len()]
    }

    /// Build-ID hex string of the target object, NUL-padded in the header.
    fn uname(&self) -> &str {
        let offset = offset_of!(KpatchHeader, uname);
        let raw = &self.data()[offset..offset + KPATCH_UNAME_LEN];
        let len = raw.iter().position(|b| *b == 0).unwrap_or(KPATCH_UNAME_LEN);
        std::str::from_utf8(&raw[..len]).unwrap_or("")
    }

    fn user_level(&self) -> u64 {
        self.get_u64(offset_of!(KpatchHeader, user_level))
    }

    fn kpatch_offset(&self) -> u64 {
        self.get_u64(offset_of!(KpatchHeader, kpatch_offset))
    }

    fn total_size(&self) -> u64 {
        self.get_u64(offset_of!(KpatchHeader, total_size))
    }

    fn jmp_offset(&self) -> u64 {
        self.get_u64(offset_of!(KpatchHeader, jmp_offset))
    }

    fn user_info(&self) -> u64 {
        self.get_u64(offset_of!(KpatchHeader, user_info))
    }

    fn user_undo(&self) -> u64 {
        self.get_u64(offset_of!(KpatchHeader, user_undo))
    }
}

pub trait HeaderWrite: OperateWrite {
    fn set_magic(&mut self) {
        self.data_mut()[..KPATCH_MAGIC.len()].copy_from_slice(&KPATCH_MAGIC);
    }

    fn set_uname(&mut self, uname: &str) {
        let offset = offset_of!(KpatchHeader, uname);
        let field = &mut self.data_mut()[offset..offset + KPATCH_UNAME_LEN];
        field.fill(0);
        let len = uname.len().min(KPATCH_UNAME_LEN - 1);
        field[..len].copy_from_slice(&uname.as_bytes()[..len]);
    }

    fn set_user_level(&mut self, value: u64) {
        self.set_u64(offset_of!(KpatchHeader, user_level), value);
    }

    fn set_kpatch_offset(&mut self, value: u64) {
        self.set_u64(offset_of!(KpatchHeader, kpatch_offset), value);
    }

    fn set_total_size(&mut self, value: u64) {
        self.set_u64(offset_of!(KpatchHeader, total_size), value);
    }

    fn set_jmp_offset(&mut self, value: u64) {
        self.set_u64(offset_of!(KpatchHeader, jmp_offset), value);
    }

    fn set_user_info(&mut self, value: u64) {
        self.set_u64(offset_of!(KpatchHeader, user_info), value);
    }

    fn set_user_undo(&mut self, value: u64) {
        self.set_u64(offset_of!(KpatchHeader, user_undo), value);
    }
}

impl HeaderRead for [u8] {}
impl HeaderWrite for [u8] {}
