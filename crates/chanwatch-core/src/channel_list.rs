use regex::Regex;

use crate::{domain::PeerRef, errors::Error, Result};

/// Parse a channel list file.
///
/// If the text contains any `t.me` links, only those are used
/// (`t.me/name`, `t.me/c/123`, with or without scheme). Otherwise each
/// non-blank line not starting with `#` is one channel. Numeric ids come
/// out in bare form, so `t.me/c/123` and `-100123` name the same channel.
pub fn parse_channel_list(text: &str) -> Result<Vec<PeerRef>> {
    let link_re = Regex::new(r"(?:https?://)?t\.me/(?:[a-z]/)?([0-9]+|[a-zA-Z0-9_]+)")
        .map_err(|e| Error::External(format!("channel link regex: {e}")))?;

    let mut out: Vec<PeerRef> = link_re
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| PeerRef::parse(m.as_str()))
        .collect();

    if out.is_empty() {
        out = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(PeerRef::parse)
            .collect();
    }

    if out.is_empty() {
        return Err(Error::Config("channel list is empty".to_string()));
    }

    let mut seen = Vec::with_capacity(out.len());
    out.retain(|p| {
        if seen.contains(p) {
            false
        } else {
            seen.push(p.clone());
            true
        }
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_win_over_lines() {
        let txt = "notes about stuff\nhttps://t.me/TechNews\nsee t.me/c/123456 too\nplain_line\n";
        let refs = parse_channel_list(txt).unwrap();
        assert_eq!(
            refs,
            vec![
                PeerRef::Handle("technews".to_string()),
                PeerRef::Id(123456),
            ]
        );
    }

    #[test]
    fn falls_back_to_lines() {
        let txt = "# sources\n@alpha\n\n  beta  \n-1001234\nalpha\n";
        let refs = parse_channel_list(txt).unwrap();
        assert_eq!(
            refs,
            vec![
                PeerRef::Handle("alpha".to_string()),
                PeerRef::Handle("beta".to_string()),
                PeerRef::Id(1234),
            ]
        );
    }

    #[test]
    fn empty_list_is_an_error() {
        let err = parse_channel_list("# nothing\n\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
