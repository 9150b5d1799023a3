/// Which child stream produced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Out,
    Err,
}

/// Receives child output as it is read
///
/// Chunks arrive in read order after they were appended to the handle's
/// own buffers.
pub trait OutputSink: Send {
    fn on_output(&mut self, kind: OutputKind, data: &[u8]);
}

impl<F> OutputSink for F
where
    F: FnMut(OutputKind, &[u8]) + Send,
{
    fn on_output(&mut self, kind: OutputKind, data: &[u8]) {
        self(kind, data)
    }
}
