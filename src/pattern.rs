use std::collections::BTreeMap;

/// One compiled pattern segment. Patterns are data, never regexes: `:name`
/// captures a single segment, `*` matches a single segment mid-path, and a
/// trailing `/*` swallows the rest of the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Capture(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
    trailing_rest: bool,
    match_all: bool,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        let trimmed = pattern.trim();
        if trimmed == "*" {
            return Self {
                segments: Vec::new(),
                trailing_rest: false,
                match_all: true,
            };
        }

        let raw_segments: Vec<&str> = split_segments(trimmed);
        let trailing_rest = raw_segments.last() == Some(&"*") && raw_segments.len() > 1;
        let take = if trailing_rest {
            raw_segments.len() - 1
        } else {
            raw_segments.len()
        };

        let segments = raw_segments[..take]
            .iter()
            .map(|segment| {
                if let Some(name) = segment.strip_prefix(':') {
                    Segment::Capture(name.to_owned())
                } else if *segment == "*" {
                    Segment::Wildcard
                } else {
                    Segment::Literal((*segment).to_owned())
                }
            })
            .collect();

        Self {
            segments,
            trailing_rest,
            match_all: false,
        }
    }

    /// Returns captured parameters on match, `None` otherwise.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        if self.match_all {
            return Some(BTreeMap::new());
        }

        let path_segments = split_segments(path);
        if self.trailing_rest {
            if path_segments.len() < self.segments.len() {
                return None;
            }
        } else if path_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (segment, actual) in self.segments.iter().zip(path_segments.iter()) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != actual {
                        return None;
                    }
                }
                Segment::Capture(name) => {
                    params.insert(name.clone(), (*actual).to_owned());
                }
                Segment::Wildcard => {}
            }
        }
        Some(params)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.matches(path).is_some()
    }
}

/// `*` is a rule-method wildcard; otherwise methods compare case-insensitively.
pub fn method_matches(rule_method: &str, request_method: &str) -> bool {
    rule_method == "*" || rule_method.eq_ignore_ascii_case(request_method)
}

pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

/// A path segment that plausibly carries an identifier: all digits, a
/// canonical UUID, a 24-hex ObjectId, or a 21-char nanoid-style token.
pub fn looks_like_id(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.bytes().all(|byte| byte.is_ascii_digit()) {
        return true;
    }
    if is_canonical_uuid(segment) {
        return true;
    }
    if segment.len() == 24 && segment.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return true;
    }
    segment.len() == 21
        && segment
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-')
}

fn is_canonical_uuid(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (idx, byte) in bytes.iter().enumerate() {
        match idx {
            8 | 13 | 18 | 23 => {
                if *byte != b'-' {
                    return false;
                }
            }
            _ => {
                if !byte.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

/// Shell-style glob where `*` spans any run of characters. Used by storage
/// path search; everything else is literal.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p_idx, mut t_idx) = (0usize, 0usize);
    let (mut star_idx, mut star_t_idx) = (None::<usize>, 0usize);

    while t_idx < text.len() {
        if p_idx < pattern.len() && (pattern[p_idx] == text[t_idx]) {
            p_idx += 1;
            t_idx += 1;
        } else if p_idx < pattern.len() && pattern[p_idx] == b'*' {
            star_idx = Some(p_idx);
            star_t_idx = t_idx;
            p_idx += 1;
        } else if let Some(star) = star_idx {
            p_idx = star + 1;
            star_t_idx += 1;
            t_idx = star_t_idx;
        } else {
            return false;
        }
    }

    while p_idx < pattern.len() && pattern[p_idx] == b'*' {
        p_idx += 1;
    }
    p_idx == pattern.len()
}
