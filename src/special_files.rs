//! Internal file handling: (listfile) and friends

use crate::Result;

/// Parse a (listfile) into individual filenames
///
/// The (listfile) format supports:
/// - One filename per line
/// - Comments starting with ';' or '#'
/// - Optional file metadata after ';' on each line
/// - Empty lines are ignored
pub fn parse_listfile(data: &[u8]) -> Result<Vec<String>> {
    let content = match std::str::from_utf8(data) {
        Ok(s) => s.to_string(),
        Err(_) => {
            log::warn!("(listfile) contains invalid UTF-8, using lossy conversion");
            String::from_utf8_lossy(data).into_owned()
        }
    };

    let files: Vec<String> = content
        .lines()
        .filter_map(|line| {
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                return None;
            }

            // Handle semicolon-separated format (filename;metadata)
            let filename = if let Some(pos) = line.find(';') {
                line[..pos].trim()
            } else {
                line
            };

            if filename.is_empty() {
                None
            } else {
                Some(filename.to_string())
            }
        })
        .collect();

    log::debug!("Parsed {} files from (listfile)", files.len());
    Ok(files)
}

/// Serialize file names into (listfile) bytes
///
/// Names are written one per line with CRLF endings, the way the
/// original tooling does.
pub fn build_listfile<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_ref().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_listfile() {
        let content = b"file1.txt\nfile2.dat\nfile3.bin";
        let files = parse_listfile(content).unwrap();
        assert_eq!(files, ["file1.txt", "file2.dat", "file3.bin"]);
    }

    #[test]
    fn test_parse_listfile_with_comments() {
        let content = b"; This is a comment\n\
                       file1.txt\n\
                       # Another comment\n\
                       file2.dat\n\
                       ; file3.txt - commented out\n\
                       file4.bin";

        let files = parse_listfile(content).unwrap();
        assert_eq!(files, ["file1.txt", "file2.dat", "file4.bin"]);
    }

    #[test]
    fn test_parse_listfile_with_metadata() {
        let content = b"file1.txt;12345\n\
                       file2.dat;67890;extra data\n\
                       file3.bin";

        let files = parse_listfile(content).unwrap();
        assert_eq!(files, ["file1.txt", "file2.dat", "file3.bin"]);
    }

    #[test]
    fn test_parse_empty_listfile() {
        let files = parse_listfile(b"").unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_parse_listfile_with_whitespace() {
        let content = b"  file1.txt  \n\tfile2.dat\t\n   file3.bin   ;   metadata   ";
        let files = parse_listfile(content).unwrap();
        assert_eq!(files, ["file1.txt", "file2.dat", "file3.bin"]);
    }

    #[test]
    fn test_build_round_trip() {
        let names = ["war3map.j", "units\\footman.mdx", "(listfile)"];
        let bytes = build_listfile(&names);
        let parsed = parse_listfile(&bytes).unwrap();
        assert_eq!(parsed, names);
    }
}
