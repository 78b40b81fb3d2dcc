//! Streaming parser for Debian control files.
//!
//! See <https://wiki.debian.org/DebianRepositoryFormat> and Debian
//! policy chapter 5. Folded fields are rare in repository indices and
//! are treated the same as multiline fields.

use hashbrown::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};

use crate::error::CacheError;

const PGP_MESSAGE_MARKER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const PGP_SIGNATURE_MARKER: &str = "-----BEGIN PGP SIGNATURE-----";

/// Paragraphs must accept field lines of at least this length.
pub(crate) const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1 MiB

/// A mapping between field names and values.
///
/// Values are a list of strings. For simple fields, the list has only
/// one element; multiline fields hold one element per continuation
/// line with surrounding whitespace stripped.
pub(crate) type Paragraph = HashMap<String, Vec<String>>;

/// Reads a control file paragraph by paragraph.
///
/// PGP preambles and signatures are ignored if any.
pub(crate) struct ControlParser<R> {
    reader: R,
    buffer: String,
    is_pgp: bool,
}

impl<R: AsyncBufRead + Unpin> ControlParser<R> {
    #[must_use]
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: String::with_capacity(256),
            is_pgp: false,
        }
    }

    /// Reads the next line into the internal buffer, without the
    /// trailing line break. `false` at the end of the stream.
    async fn next_line(&mut self) -> Result<bool, CacheError> {
        self.buffer.clear();

        let bytes_read = self
            .reader
            .read_line(&mut self.buffer)
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::InvalidData {
                    CacheError::MalformedControl(String::from("invalid utf-8"))
                } else {
                    CacheError::Io(err)
                }
            })?;

        if bytes_read == 0 {
            return Ok(false);
        }

        if bytes_read > MAX_LINE_LENGTH {
            return Err(CacheError::MalformedControl(String::from("oversized line")));
        }

        while self.buffer.ends_with('\n') || self.buffer.ends_with('\r') {
            self.buffer.pop();
        }

        Ok(true)
    }

    /// Reads one paragraph, terminated by a blank line or the end of
    /// the stream.
    ///
    /// Returns `Ok(None)` once no more paragraphs can be read.
    pub(crate) async fn read_paragraph(&mut self) -> Result<Option<Paragraph>, CacheError> {
        let mut fields = Paragraph::new();
        let mut last_field = String::new();

        loop {
            if !self.next_line().await? {
                break;
            }

            if self.buffer.is_empty() {
                if fields.is_empty() && last_field.is_empty() {
                    // leading blank lines before the paragraph
                    continue;
                }
                break;
            }

            if self.buffer.starts_with('#') {
                continue;
            }

            if self.buffer == PGP_MESSAGE_MARKER {
                self.is_pgp = true;

                // drop the armor header block up to the next blank line
                while self.next_line().await? && !self.buffer.is_empty() {}
                continue;
            }

            if self.is_pgp && self.buffer == PGP_SIGNATURE_MARKER {
                // the signed body has ended, drop the rest of the stream
                while self.next_line().await? {}
                break;
            }

            if self.buffer.starts_with(' ') || self.buffer.starts_with('\t') {
                if last_field.is_empty() {
                    return Err(CacheError::MalformedControl(self.buffer.clone()));
                }
                let value = self.buffer.trim_matches([' ', '\t']).to_string();
                fields.entry_ref(last_field.as_str()).or_default().push(value);
                continue;
            }

            let Some((name, value)) = self.buffer.split_once(':') else {
                return Err(CacheError::MalformedControl(self.buffer.clone()));
            };

            let value = value.trim_matches([' ', '\t']);
            if value.is_empty() {
                // empty-valued fields stay usable as continuation anchors
                last_field.clear();
                last_field.push_str(name);
                continue;
            }
            fields.entry_ref(name).or_default().push(value.to_string());

            last_field.clear();
            last_field.push_str(name);
        }

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }
}
