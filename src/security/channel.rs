//! Channel parsing
//!
//! A channel string has the shape `key/part/part/.../?opt=value&opt=value`.
//! Parsing is a single pass over the bytes; the first invalid byte yields an
//! [`ChannelKind::Invalid`] channel carrying nothing else.

use smallvec::SmallVec;

use crate::clock::{MAX_TIME, MIN_TIME};
use crate::hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Invalid,
    Static,
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Key segment as sent by the client (base64 text or `emitter`)
    pub key: Vec<u8>,
    /// Channel path with its trailing `/`, options excluded
    pub channel: Vec<u8>,
    /// Hash of every path segment
    pub query: SmallVec<[u32; 8]>,
    pub options: Vec<(String, String)>,
    pub kind: ChannelKind,
}

#[inline]
fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

#[inline]
fn is_part_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'$' | b'.' | b'-' | b':')
}

impl Channel {
    fn invalid() -> Self {
        Self {
            key: Vec::new(),
            channel: Vec::new(),
            query: SmallVec::new(),
            options: Vec::new(),
            kind: ChannelKind::Invalid,
        }
    }

    pub fn parse(text: &[u8]) -> Self {
        parse_inner(text).unwrap_or_else(Self::invalid)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.kind != ChannelKind::Invalid
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.kind == ChannelKind::Static
    }

    /// Hash of the first path segment.
    pub fn target(&self) -> u32 {
        self.query.first().copied().unwrap_or(0)
    }

    pub fn key_str(&self) -> &str {
        std::str::from_utf8(&self.key).unwrap_or_default()
    }

    /// Path text, e.g. `a/b/c/`.
    pub fn path(&self) -> &str {
        std::str::from_utf8(&self.channel).unwrap_or_default()
    }

    /// Path segments without the trailing empty one.
    pub fn parts(&self) -> Vec<&str> {
        let path = self.path();
        let path = path.strip_suffix('/').unwrap_or(path);
        if path.is_empty() {
            return Vec::new();
        }
        path.split('/').collect()
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Message time-to-live in seconds.
    pub fn ttl(&self) -> Option<u32> {
        self.option("ttl").and_then(|v| v.parse().ok())
    }

    /// Number of historical messages requested.
    pub fn last(&self) -> Option<u32> {
        self.option("last").and_then(|v| v.parse().ok())
    }

    /// Unix second window `(from, until)`; bounds outside the supported
    /// range are ignored.
    pub fn window(&self) -> (i64, i64) {
        let bound = |name| {
            self.option(name)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|t| (MIN_TIME..=MAX_TIME).contains(t))
        };
        (bound("from").unwrap_or(0), bound("until").unwrap_or(i64::MAX))
    }

    /// `me=0` asks not to receive one's own publications.
    pub fn exclude_me(&self) -> bool {
        matches!(self.option("me"), Some("0") | Some("false"))
    }
}

fn parse_inner(text: &[u8]) -> Option<Channel> {
    let slash = text.iter().position(|&b| b == b'/')?;
    let key = &text[..slash];
    if key.is_empty() || !key.iter().all(|&b| is_key_byte(b)) {
        return None;
    }

    let rest = &text[slash + 1..];
    let mut query = SmallVec::new();
    let mut wildcard = false;
    let mut terminal = false;
    let mut start = 0;
    let mut end = rest.len();
    let mut has_options = false;

    for (i, &b) in rest.iter().enumerate() {
        match b {
            b'/' => {
                let segment = &rest[start..i];
                if segment.is_empty() || terminal {
                    return None;
                }
                match segment {
                    b"#" => {
                        wildcard = true;
                        terminal = true;
                    }
                    b"+" => wildcard = true,
                    _ if segment.iter().all(|&b| is_part_byte(b)) => {}
                    _ => return None,
                }
                query.push(hash::murmur32(segment));
                start = i + 1;
            }
            b'?' => {
                end = i;
                has_options = true;
                break;
            }
            b'+' | b'#' => {}
            _ if is_part_byte(b) => {}
            _ => return None,
        }
    }

    // Every segment must be closed by a slash.
    if start != end || query.is_empty() {
        return None;
    }

    let options = if has_options {
        parse_options(&rest[end + 1..])?
    } else {
        Vec::new()
    };

    Some(Channel {
        key: key.to_vec(),
        channel: rest[..end].to_vec(),
        query,
        options,
        kind: if wildcard {
            ChannelKind::Wildcard
        } else {
            ChannelKind::Static
        },
    })
}

fn parse_options(text: &[u8]) -> Option<Vec<(String, String)>> {
    let mut options = Vec::new();
    for pair in text.split(|&b| b == b'&') {
        let eq = pair.iter().position(|&b| b == b'=')?;
        let (k, v) = (&pair[..eq], &pair[eq + 1..]);
        if k.is_empty() || v.is_empty() {
            return None;
        }
        if !k.iter().chain(v.iter()).all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        // Only ASCII alphanumerics reach this point.
        options.push((
            String::from_utf8_lossy(k).into_owned(),
            String::from_utf8_lossy(v).into_owned(),
        ));
    }
    Some(options)
}

/// Normalises a subscription topic: a bare trailing `#` gains its slash and
/// doubled slashes collapse.
pub fn normalize_subscription(topic: &[u8]) -> Vec<u8> {
    let (path, options) = match topic.iter().position(|&b| b == b'?') {
        Some(q) => topic.split_at(q),
        None => (topic, &[][..]),
    };

    let mut out = Vec::with_capacity(topic.len() + 1);
    for &b in path {
        if b == b'/' && out.last() == Some(&b'/') {
            continue;
        }
        out.push(b);
    }
    if out.last() == Some(&b'#') {
        out.push(b'/');
    }
    out.extend_from_slice(options);
    out
}
