use std::collections::HashSet;
use std::io;
use std::path::Path;

use tracing::debug;

/// Stream names clients may start sessions for.
///
/// Loaded from the media list file: one `<source>,<name>` entry per line, `#` comment lines and
/// lines without exactly two fields are skipped. Names are compared without their leading slash.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    names: HashSet<String>,
}

impl Whitelist {
    pub fn load(path: &Path) -> io::Result<Self> {
        let whitelist = Self::parse(&std::fs::read_to_string(path)?);
        debug!("Loaded {} stream names from {}", whitelist.len(), path.display());
        Ok(whitelist)
    }

    pub fn parse(content: &str) -> Self {
        let names = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let fields: Vec<&str> = line.split(',').collect();
                match fields.as_slice() {
                    [_, name] => Some(normalize(name)),
                    _ => None,
                }
            })
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        Self { names }
    }

    pub fn contains(&self, uri: &str) -> bool {
        let uri = normalize(uri);
        !uri.is_empty() && self.names.contains(uri)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for Whitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter
                .into_iter()
                .map(|name| normalize(name.as_ref()).to_owned())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }
}

fn normalize(name: &str) -> &str {
    let name = name.trim();
    name.strip_prefix('/').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA_LIST: &str = "\
# source, stream name
/media/a.mp4, stream1.mp4
rtmp, /live/stream2.mp4

broken line
a,b,c
,  ,
";

    #[test]
    fn parses_the_media_list_format() {
        let whitelist = Whitelist::parse(MEDIA_LIST);
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.contains("stream1.mp4"));
        assert!(whitelist.contains("/stream1.mp4"));
        assert!(whitelist.contains("live/stream2.mp4"));
        assert!(!whitelist.contains("stream1"));
        assert!(!whitelist.contains("b"));
        assert!(!whitelist.contains(""));
        assert!(!whitelist.contains("/"));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media_list.txt");
        std::fs::write(&path, MEDIA_LIST).unwrap();
        assert_eq!(Whitelist::load(&path).unwrap().len(), 2);
        assert!(Whitelist::load(&dir.path().join("missing.txt")).is_err());
    }
}
