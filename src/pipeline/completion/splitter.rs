//! Splitting reply text into speakable fragments

/// Incremental splitter over streamed reply text
///
/// Text is cut at the pause marker the model is prompted to insert. When the
/// model runs on without a marker, the pending text is cut at the last
/// whitespace before `target_chars` so synthesis can start early.
#[derive(Debug, Clone)]
pub struct FragmentSplitter {
    marker: char,
    target_chars: usize,
    pending: String,
}

impl FragmentSplitter {
    #[must_use]
    pub const fn new(marker: char, target_chars: usize) -> Self {
        Self {
            marker,
            target_chars,
            pending: String::new(),
        }
    }

    /// Append text and return every fragment that became complete
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);

        let mut fragments = Vec::new();
        loop {
            let leading = self.pending.len() - self.pending.trim_start().len();
            self.pending.drain(..leading);

            if let Some(pos) = self.pending.find(self.marker) {
                let fragment = self.pending[..pos].trim().to_string();
                self.pending.drain(..pos + self.marker.len_utf8());
                if !fragment.is_empty() {
                    fragments.push(fragment);
                }
                continue;
            }

            match self.long_run_cut() {
                Some(cut) => {
                    let fragment = self.pending[..cut].trim().to_string();
                    self.pending.drain(..cut);
                    fragments.push(fragment);
                }
                None => break,
            }
        }
        fragments
    }

    /// Flush whatever text is left once the reply is complete
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.pending.trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// Byte offset to cut a marker-less run at, if it has grown past the target
    fn long_run_cut(&self) -> Option<usize> {
        let limit = self.pending.char_indices().nth(self.target_chars).map(|(i, _)| i)?;

        self.pending[..limit]
            .rfind(char::is_whitespace)
            .filter(|&i| i > 0)
            .or_else(|| {
                self.pending[limit..]
                    .find(char::is_whitespace)
                    .map(|i| i + limit)
            })
    }
}
