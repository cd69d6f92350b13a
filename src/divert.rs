use std::collections::BTreeMap;
use std::mem;

/// Output router with out-of-order buffering.
///
/// Index 0 goes straight to the output queue, negative indices discard,
/// positive indices append to a lazily-created buffer that is removed
/// again when drained. Literal text coalesces into the open output
/// chunk; a drained diversion is always emitted as its own chunk.
#[derive(Debug, Default)]
pub struct Diversions {
    current: i64,
    bufs: BTreeMap<i64, String>,
    out: Vec<String>,
    open: bool,
}

impl Diversions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn divert(&mut self, ix: i64) {
        self.current = ix;
        if ix > 0 {
            self.bufs.entry(ix).or_default();
        }
    }

    pub fn divnum(&self) -> i64 {
        self.current
    }

    /// Route text according to the current diversion index.
    pub fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.current {
            ix if ix < 0 => {}
            0 => {
                if self.open {
                    if let Some(chunk) = self.out.last_mut() {
                        chunk.push_str(text);
                        return;
                    }
                }
                self.out.push(text.to_string());
                self.open = true;
            }
            ix => {
                self.bufs.entry(ix).or_default().push_str(text);
            }
        }
    }

    /// Drain one diversion and remove it. Draining the current diversion
    /// or an already-drained index is a silent no-op.
    pub fn undivert_one(&mut self, ix: i64) {
        if ix == self.current {
            return;
        }
        if let Some(text) = self.bufs.remove(&ix) {
            self.replay(text);
        }
    }

    /// Drain all diversions in ascending index order, skipping the
    /// current one.
    pub fn undivert_all(&mut self) {
        let indices: Vec<i64> = self
            .bufs
            .keys()
            .copied()
            .filter(|&ix| ix != self.current)
            .collect();
        for ix in indices {
            if let Some(text) = self.bufs.remove(&ix) {
                self.replay(text);
            }
        }
    }

    fn replay(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        match self.current {
            ix if ix < 0 => {}
            0 => {
                self.out.push(text);
                self.open = false;
            }
            ix => {
                self.bufs.entry(ix).or_default().push_str(&text);
            }
        }
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.open = false;
        mem::take(&mut self.out)
    }

    pub fn discard_output(&mut self) {
        self.open = false;
        self.out.clear();
    }
}
