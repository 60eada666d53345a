const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8; 5] = b"ustar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
}

impl ArchiveFormat {
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(&GZIP_MAGIC) {
            return Some(Self::TarGz);
        }
        let magic_end = TAR_MAGIC_OFFSET + TAR_MAGIC.len();
        if header.len() >= magic_end && &header[TAR_MAGIC_OFFSET..magic_end] == TAR_MAGIC {
            return Some(Self::Tar);
        }
        None
    }
}
