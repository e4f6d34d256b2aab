//! Small edits to raw card text that the protocol layer depends on.

use sha1::{Digest, Sha1};

use crate::parser::extract_pseudo_header;

/// Property the library embeds to remember a card's server reference.
pub const URI_PROPERTY: &str = "URI";

/// Ensure the card has a `UID` property, generating one if needed.
///
/// Returns the card (possibly rewritten) and its UID.
pub fn ensure_uid(card: &str) -> (String, String) {
    if let Some(uid) = extract_pseudo_header("UID", card, true) {
        return (card.to_string(), uid);
    }

    let uid = uuid::Uuid::new_v4().to_string();
    let newline = line_ending(card);
    let line = format!("UID:{}{}", uid, newline);

    let rewritten = match find_line(card, "BEGIN:VCARD") {
        Some(range) => {
            let mut out = String::with_capacity(card.len() + line.len());
            out.push_str(&card[..range.end]);
            out.push_str(&line);
            out.push_str(&card[range.end..]);
            out
        }
        None => format!("{}{}", line, card),
    };
    (rewritten, uid)
}

/// Resource name for a new card: SHA-1 of its UID plus `.vcf`.
pub fn resource_name(uid: &str) -> String {
    let digest = Sha1::digest(uid.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}.vcf", hex)
}

/// Embed the server reference as a `URI:` property before `END:VCARD`.
///
/// An existing `URI` line is replaced.
pub fn annotate_uri(card: &str, href: &str) -> String {
    let newline = line_ending(card);
    let mut out = String::with_capacity(card.len() + href.len() + 8);
    let mut inserted = false;

    for line in card.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\r', '\n']);
        let name = bare.split([':', ';']).next().unwrap_or("");
        if name.eq_ignore_ascii_case(URI_PROPERTY) {
            continue;
        }
        if !inserted && bare.trim().eq_ignore_ascii_case("END:VCARD") {
            out.push_str(URI_PROPERTY);
            out.push(':');
            out.push_str(href);
            out.push_str(newline);
            inserted = true;
        }
        out.push_str(line);
    }

    if !inserted {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push_str(newline);
        }
        out.push_str(&format!("{}:{}{}", URI_PROPERTY, href, newline));
    }
    out
}

/// Drop any `URI` property before the card goes back to the server.
pub fn strip_uri(card: &str) -> String {
    card.split_inclusive('\n')
        .filter(|line| {
            let name = line.split([':', ';']).next().unwrap_or("");
            !name.trim().eq_ignore_ascii_case(URI_PROPERTY)
        })
        .collect()
}

fn line_ending(card: &str) -> &'static str {
    if card.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Byte range of the first line equal to `wanted` (ignoring case), newline included.
fn find_line(card: &str, wanted: &str) -> Option<std::ops::Range<usize>> {
    let mut offset = 0;
    for line in card.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        if line.trim().eq_ignore_ascii_case(wanted) {
            if line.ends_with('\n') {
                return Some(start..offset);
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_uid_keeps_existing() {
        let card = "BEGIN:VCARD\r\nUID:keep-me\r\nEND:VCARD\r\n";
        let (out, uid) = ensure_uid(card);
        assert_eq!(out, card);
        assert_eq!(uid, "keep-me");
    }

    #[test]
    fn test_ensure_uid_inserts_after_begin() {
        let card = "BEGIN:VCARD\r\nVERSION:3.0\r\nFN:X\r\nEND:VCARD\r\n";
        let (out, uid) = ensure_uid(card);
        assert!(out.starts_with(&format!("BEGIN:VCARD\r\nUID:{}\r\nVERSION:3.0", uid)));
        assert_eq!(extract_pseudo_header("UID", &out, true), Some(uid));
    }

    #[test]
    fn test_resource_name_is_stable() {
        let a = resource_name("uid-1");
        assert_eq!(a, resource_name("uid-1"));
        assert_ne!(a, resource_name("uid-2"));
        assert_eq!(a.len(), 40 + ".vcf".len());
        assert!(a.ends_with(".vcf"));
    }

    #[test]
    fn test_annotate_uri_inserts_before_end() {
        let card = "BEGIN:VCARD\nUID:1\nEND:VCARD";
        assert_eq!(
            annotate_uri(card, "/ab/1.vcf"),
            "BEGIN:VCARD\nUID:1\nURI:/ab/1.vcf\nEND:VCARD"
        );
    }

    #[test]
    fn test_annotate_uri_replaces_existing() {
        let card = "BEGIN:VCARD\r\nURI:/old.vcf\r\nUID:1\r\nEND:VCARD\r\n";
        let out = annotate_uri(card, "/new.vcf");
        assert_eq!(out, "BEGIN:VCARD\r\nUID:1\r\nURI:/new.vcf\r\nEND:VCARD\r\n");
        assert_eq!(extract_pseudo_header("URI", &out, false), Some("/new.vcf".to_string()));
    }

    #[test]
    fn test_strip_uri() {
        let card = "BEGIN:VCARD\r\nUID:1\r\nURI:/ab/1.vcf\r\nEND:VCARD\r\n";
        assert_eq!(strip_uri(card), "BEGIN:VCARD\r\nUID:1\r\nEND:VCARD\r\n");
        let plain = "BEGIN:VCARD\nURL:http://x\nEND:VCARD";
        assert_eq!(strip_uri(plain), plain);
    }
}
