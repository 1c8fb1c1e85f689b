//! Block-level edits of a shared `~/.ssh/config`
//!
//! The file is split once into a preamble and a sequence of blocks, each
//! starting at a top-level `Host` or `Match` line and running up to the next
//! one. Upsert and remove replace or drop exactly one block's lines;
//! everything else is copied through untouched, including user-authored
//! blocks, comments and line endings.

use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::sanitize::validate_alias;
use crate::error::{DevboxError, Result};
use crate::files::{self, FileLock};

/// Kind of top-level header line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// `Host <pattern>...`
    Host,
    /// `Match <criteria>...`
    Match,
}

/// One block of the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Header keyword
    pub kind: HeaderKind,
    /// Patterns (for `Host`) or criteria tokens (for `Match`)
    pub patterns: Vec<String>,
    /// 1-based line number of the header
    pub line: usize,
    /// Byte span from the header to the next header or end of file
    pub span: Range<usize>,
}

impl Block {
    /// Whether the header is exactly `Host <alias>`
    pub fn is_alias(&self, alias: &str) -> bool {
        self.kind == HeaderKind::Host && self.patterns.len() == 1 && self.patterns[0] == alias
    }

    /// Whether the block applies to every host (`Host *` or `Match all`)
    ///
    /// ssh uses the first value it finds for each option, so new container
    /// blocks go before such catch-alls.
    pub fn is_catch_all(&self) -> bool {
        match self.kind {
            HeaderKind::Host => self.patterns.iter().any(|p| p == "*"),
            HeaderKind::Match => {
                self.patterns.len() == 1 && self.patterns[0].eq_ignore_ascii_case("all")
            }
        }
    }
}

/// A parsed SSH client config
#[derive(Debug, Clone)]
pub struct SshConfigFile {
    path: PathBuf,
    text: String,
    blocks: Vec<Block>,
}

impl SshConfigFile {
    /// Split `text` into blocks; `path` is only used in error messages
    pub fn parse(path: impl Into<PathBuf>, text: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let text = text.into();
        let mut blocks: Vec<Block> = Vec::new();

        let mut offset = 0;
        for (index, line) in text.split_inclusive('\n').enumerate() {
            if let Some((kind, patterns)) = parse_header(line) {
                if kind == HeaderKind::Host && patterns.is_empty() {
                    return Err(DevboxError::config_malformed(
                        &path,
                        format!("line {}: Host without a pattern", index + 1),
                    ));
                }
                if let Some(previous) = blocks.last_mut() {
                    previous.span.end = offset;
                }
                blocks.push(Block {
                    kind,
                    patterns,
                    line: index + 1,
                    span: offset..text.len(),
                });
            }
            offset += line.len();
        }

        Ok(Self { path, text, blocks })
    }

    /// Read and parse the file at `path`; a missing file parses as empty
    pub fn load(path: &Path) -> Result<Self> {
        let text = match files::read_optional(path)? {
            None => String::new(),
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| DevboxError::config_malformed(path, "not valid UTF-8"))?,
        };
        Self::parse(path, text)
    }

    /// The raw text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// All blocks in file order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The block whose header is exactly `Host <alias>`
    ///
    /// More than one such block makes the target ambiguous, so that fails
    /// instead of guessing.
    pub fn find(&self, alias: &str) -> Result<Option<&Block>> {
        let mut matches = self.blocks.iter().filter(|b| b.is_alias(alias));
        let first = matches.next();
        if let Some(second) = matches.next() {
            return Err(DevboxError::config_malformed(
                &self.path,
                format!(
                    "Host {} appears more than once (lines {} and {})",
                    alias,
                    first.map_or(0, |b| b.line),
                    second.line
                ),
            ));
        }
        Ok(first)
    }

    /// Text of the block for `alias`, if present
    pub fn block_text(&self, alias: &str) -> Result<Option<&str>> {
        Ok(self
            .find(alias)?
            .map(|b| &self.text[b.span.start..self.owned_end(b)]))
    }

    /// New file text with `block` as the only block for `alias`
    pub fn upsert(&self, alias: &str, block: &str) -> Result<String> {
        let block = normalize_block(alias, block)?;

        if let Some(existing) = self.find(alias)? {
            let owned_end = self.owned_end(existing);
            let mut out = String::with_capacity(self.text.len() + block.len());
            out.push_str(&self.text[..existing.span.start]);
            out.push_str(&block);
            out.push_str(&self.text[owned_end..]);
            return Ok(out);
        }

        if let Some(catch_all) = self.blocks.iter().find(|b| b.is_catch_all()) {
            let at = self.leading_comment_start(catch_all.span.start);
            let mut out = String::with_capacity(self.text.len() + block.len() + 1);
            out.push_str(&self.text[..at]);
            out.push_str(&block);
            out.push('\n');
            out.push_str(&self.text[at..]);
            return Ok(out);
        }

        let mut out = self.text.clone();
        if !out.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            if !out.ends_with("\n\n") {
                out.push('\n');
            }
        }
        out.push_str(&block);
        Ok(out)
    }

    /// New file text without the block for `alias`, or `None` if absent
    pub fn remove(&self, alias: &str) -> Result<Option<String>> {
        let Some(existing) = self.find(alias)? else {
            return Ok(None);
        };

        // Blank lines directly after the block go with it; a comment that
        // introduces the next block stays.
        let mut end = self.owned_end(existing);
        for line in self.text[end..existing.span.end].split_inclusive('\n') {
            if !line.trim().is_empty() {
                break;
            }
            end += line.len();
        }

        let mut out = String::with_capacity(self.text.len());
        out.push_str(&self.text[..existing.span.start]);
        out.push_str(&self.text[end..]);

        let trimmed_len = out.trim_end_matches(['\n', '\r', ' ', '\t']).len();
        out.truncate(trimmed_len);
        if !out.is_empty() {
            out.push('\n');
        }
        Ok(Some(out))
    }

    /// Start of the column-0 comment lines directly above the line at `at`
    ///
    /// Such comments describe the block that follows them and must stay
    /// attached to it.
    fn leading_comment_start(&self, at: usize) -> usize {
        let mut start = at;
        while start > 0 {
            let before = &self.text[..start - 1];
            let line_start = before.rfind('\n').map_or(0, |i| i + 1);
            if !self.text[line_start..start].starts_with('#') {
                break;
            }
            start = line_start;
        }
        start
    }

    /// End of the block's own lines: the header through its last directive
    ///
    /// Blank and comment lines after the last directive are not part of the
    /// block; they usually separate or describe whatever comes next.
    fn owned_end(&self, block: &Block) -> usize {
        let mut offset = block.span.start;
        let mut end = offset;
        for line in self.text[block.span.clone()].split_inclusive('\n') {
            offset += line.len();
            let trimmed = line.trim();
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                end = offset;
            }
        }
        end
    }
}

/// Insert or replace the block for `alias` in the config file at `path`
///
/// Returns whether the file changed.
pub fn upsert(path: &Path, alias: &str, block: &str) -> Result<bool> {
    let target = files::resolve_target(path)?;
    let _lock = FileLock::acquire(&target)?;

    let config = SshConfigFile::load(&target)?;
    let updated = config.upsert(alias, block)?;
    if updated == config.text() {
        debug!("SSH config block for {} unchanged", alias);
        return Ok(false);
    }

    files::write_atomic(&target, updated.as_bytes(), None)?;
    info!("Updated SSH config block for {} in {}", alias, target.display());
    Ok(true)
}

/// Delete the block for `alias` from the config file at `path`
///
/// Returns whether a block was removed; a missing alias or file is a no-op.
pub fn remove(path: &Path, alias: &str) -> Result<bool> {
    let target = files::resolve_target(path)?;
    if !target.exists() {
        return Ok(false);
    }
    let _lock = FileLock::acquire(&target)?;

    let config = SshConfigFile::load(&target)?;
    let Some(updated) = config.remove(alias)? else {
        debug!("No SSH config block for {}", alias);
        return Ok(false);
    };

    files::write_atomic(&target, updated.as_bytes(), None)?;
    info!("Removed SSH config block for {} from {}", alias, target.display());
    Ok(true)
}

/// Recognize a top-level `Host`/`Match` line
///
/// Keywords are case-insensitive and may be followed by whitespace or `=`,
/// as ssh_config allows.
fn parse_header(line: &str) -> Option<(HeaderKind, Vec<String>)> {
    let trimmed = line.trim_start();
    let keyword_len = trimmed
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(trimmed.len());
    let (keyword, rest) = trimmed.split_at(keyword_len);

    let kind = if keyword.eq_ignore_ascii_case("host") {
        HeaderKind::Host
    } else if keyword.eq_ignore_ascii_case("match") {
        HeaderKind::Match
    } else {
        return None;
    };

    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest);
    let patterns = rest
        .split('#')
        .next()
        .unwrap_or("")
        .split_whitespace()
        .map(|p| p.trim_matches('"').to_string())
        .collect();

    Some((kind, patterns))
}

/// Check that `block` is a single `Host <alias>` block and newline-terminate it
fn normalize_block(alias: &str, block: &str) -> Result<String> {
    let alias = validate_alias(alias)?;
    let parsed = SshConfigFile::parse("<rendered block>", block)?;

    let valid = parsed.blocks.len() == 1
        && parsed.blocks[0].is_alias(alias)
        && parsed.blocks[0].span.start == 0;
    if !valid {
        return Err(DevboxError::invalid_params(format!(
            "block for {} must be a single `Host {}` stanza",
            alias, alias
        )));
    }

    let mut block = block.trim_end_matches(['\n', '\r', ' ', '\t']).to_string();
    block.push('\n');
    Ok(block)
}
