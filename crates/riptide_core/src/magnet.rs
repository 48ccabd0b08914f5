use std::str::FromStr;

use anyhow::Context;

use crate::hash_id::{Id20, Id32};

/// A parsed magnet link: the info-hash plus whatever optional metadata
/// the link carried. Each `tr` parameter becomes its own tier (BEP-12
/// says nothing about magnet tiers, so the flat form is canonical).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub info_hash: Option<Id20>,
    pub info_hash_v2: Option<Id32>,
    pub name: Option<String>,
    pub trackers: Vec<String>,
    pub webseeds: Vec<String>,
}

impl Magnet {
    pub fn from_id20(info_hash: Id20, trackers: Vec<String>) -> Self {
        Self {
            info_hash: Some(info_hash),
            info_hash_v2: None,
            name: None,
            trackers,
            webseeds: Vec::new(),
        }
    }

    /// Parse a magnet link. Unknown query parameters are ignored.
    pub fn parse(input: &str) -> anyhow::Result<Magnet> {
        let url = url::Url::parse(input).context("magnet link must be a valid URL")?;
        if url.scheme() != "magnet" {
            anyhow::bail!("expected scheme magnet");
        }
        let mut info_hash: Option<Id20> = None;
        let mut info_hash_v2: Option<Id32> = None;
        let mut name: Option<String> = None;
        let mut trackers = Vec::<String>::new();
        let mut webseeds = Vec::<String>::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(ih) = value.as_ref().strip_prefix("urn:btih:") {
                        let id = Id20::from_str(ih)
                            .with_context(|| format!("invalid v1 info-hash {ih:?}"))?;
                        info_hash.replace(id);
                    } else if let Some(ih) = value.as_ref().strip_prefix("urn:btmh:1220") {
                        let id = Id32::from_str(ih)
                            .with_context(|| format!("invalid v2 info-hash {ih:?}"))?;
                        info_hash_v2.replace(id);
                    } else {
                        anyhow::bail!("expected xt to start with urn:btih or urn:btmh:1220");
                    }
                }
                "dn" => name = Some(value.into_owned()),
                "ws" => webseeds.push(value.into_owned()),
                // "tr.1", "tr.2" etc. are a historical dodge around
                // clients that deduplicated repeated keys
                k if k == "tr" || k.starts_with("tr.") => trackers.push(value.into_owned()),
                _ => {}
            }
        }
        if info_hash.is_none() && info_hash_v2.is_none() {
            anyhow::bail!("magnet link carries no info-hash");
        }
        Ok(Magnet {
            info_hash,
            info_hash_v2,
            name,
            trackers,
            webseeds,
        })
    }
}

impl std::fmt::Display for Magnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "magnet:")?;
        let mut write_separator = {
            let mut written_so_far = 0;
            move |f: &mut std::fmt::Formatter<'_>| -> std::fmt::Result {
                if written_so_far == 0 {
                    write!(f, "?")?;
                } else {
                    write!(f, "&")?;
                }
                written_so_far += 1;
                Ok(())
            }
        };
        if let Some(id) = self.info_hash {
            write_separator(f)?;
            write!(f, "xt=urn:btih:{}", id.as_string())?;
        }
        if let Some(id) = self.info_hash_v2 {
            write_separator(f)?;
            write!(f, "xt=urn:btmh:1220{}", id.as_string())?;
        }
        if let Some(name) = &self.name {
            write_separator(f)?;
            write!(f, "dn={}", urlencoding::encode(name))?;
        }
        for tracker in self.trackers.iter() {
            write_separator(f)?;
            write!(f, "tr={}", urlencoding::encode(tracker))?;
        }
        for webseed in self.webseeds.iter() {
            write_separator(f)?;
            write!(f, "ws={}", urlencoding::encode(webseed))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_MAGNET: &str = "magnet:?xt=urn:btih:d2354010a3ca4ade5b7427bb093a62a3899ff381&dn=Display%20Name&tr=http%3A%2F%2Ftracker.openbittorrent.com%2Fannounce&tr=http%3A%2F%2Ftracker.opentracker.org%2Fannounce&ws=http%3A%2F%2Fserver.webseed.org%2Fpath%2Fto%2Ffile";

    #[test]
    fn test_parse_seed_magnet() {
        let m = Magnet::parse(SEED_MAGNET).unwrap();
        assert_eq!(
            m.info_hash.unwrap().as_string(),
            "d2354010a3ca4ade5b7427bb093a62a3899ff381"
        );
        assert_eq!(m.name.as_deref(), Some("Display Name"));
        assert_eq!(
            m.trackers,
            vec![
                "http://tracker.openbittorrent.com/announce",
                "http://tracker.opentracker.org/announce"
            ]
        );
        assert_eq!(m.webseeds, vec!["http://server.webseed.org/path/to/file"]);
    }

    #[test]
    fn test_parse_base32_same_hash() {
        let m = Magnet::parse(
            "magnet:?xt=urn:btih:2I2UAEFDZJFN4W3UE65QSOTCUOEZ744B&dn=Display%20Name",
        )
        .unwrap();
        assert_eq!(
            m.info_hash.unwrap().as_string(),
            "d2354010a3ca4ade5b7427bb093a62a3899ff381"
        );
    }

    #[test]
    fn test_parse_v2() {
        let m = Magnet::parse(
            "magnet:?xt=urn:btmh:1220caf1e1c30e81cb361b9ee167c4aa64228a7fa4fa9f6105232b28ad099f3a302e",
        )
        .unwrap();
        assert!(m.info_hash.is_none());
        assert_eq!(
            m.info_hash_v2.unwrap().as_string(),
            "caf1e1c30e81cb361b9ee167c4aa64228a7fa4fa9f6105232b28ad099f3a302e"
        );
    }

    #[test]
    fn test_numbered_tr_keys() {
        let m = Magnet::parse(
            "magnet:?xt=urn:btih:d2354010a3ca4ade5b7427bb093a62a3899ff381&tr.1=udp%3A%2F%2Fa%3A1&tr.2=udp%3A%2F%2Fb%3A2",
        )
        .unwrap();
        assert_eq!(m.trackers, vec!["udp://a:1", "udp://b:2"]);
    }

    #[test]
    fn test_unknown_params_ignored() {
        let m = Magnet::parse(
            "magnet:?xt=urn:btih:d2354010a3ca4ade5b7427bb093a62a3899ff381&x.pe=1.2.3.4%3A5",
        )
        .unwrap();
        assert!(m.trackers.is_empty());
    }

    #[test]
    fn test_missing_info_hash_rejected() {
        assert!(Magnet::parse("magnet:?dn=foo").is_err());
        assert!(Magnet::parse("http://not-a-magnet/").is_err());
    }

    #[test]
    fn test_format_parse_round_trip() {
        let m = Magnet::parse(SEED_MAGNET).unwrap();
        let formatted = m.to_string();
        let reparsed = Magnet::parse(&formatted).unwrap();
        assert_eq!(m, reparsed);
    }
}
