/// Append-only capture of one child output stream
///
/// Full reads always start at offset 0; the incremental cursor only moves
/// forward until the buffer is explicitly cleared.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    data: Vec<u8>,
    incremental_offset: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Everything captured since the last clear
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Bytes appended since the previous incremental read
    pub fn read_incremental(&mut self) -> Vec<u8> {
        let latest = self.data[self.incremental_offset..].to_vec();
        self.incremental_offset = self.data.len();
        latest
    }

    pub fn incremental_offset(&self) -> usize {
        self.incremental_offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Truncate the capture and rewind the incremental cursor
    pub fn clear(&mut self) {
        self.data.clear();
        self.incremental_offset = 0;
    }
}
