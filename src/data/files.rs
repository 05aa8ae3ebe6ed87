use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

const TAIL_CHUNK: u64 = 4096;

/// Appends `lines` to a header-prefixed record file in a single write.
///
/// A missing or empty file gets the header first. An existing file whose
/// first line is not `header` is migrated: rewritten with the current header
/// and its previous body, keeping the old first line only if `is_record`
/// accepts it.
pub fn append_lines<F>(path: &Path, header: &str, lines: &[String], is_record: F) -> io::Result<()>
where
    F: Fn(&str) -> bool,
{
    if lines.is_empty() {
        return Ok(());
    }
    ensure_parent(path)?;
    ensure_header(path, header, is_record)?;

    let mut file = OpenOptions::new().read(true).append(true).open(path)?;

    let mut buf = String::new();
    if !ends_with_newline(&mut file)? {
        buf.push('\n');
    }
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())?;
    file.flush()
}

/// All non-header lines of the file, or nothing if it does not exist yet.
pub fn read_body(path: &Path, header: &str) -> io::Result<Vec<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut lines = contents.lines().peekable();
    if lines.peek() == Some(&header) {
        lines.next();
    }
    Ok(lines
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// The last `n` record lines, read backwards from the end of the file so the
/// cost does not grow with file length.
pub fn read_tail(path: &Path, header: &str, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut start = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();
    while start > 0 {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        if buf.iter().filter(|&&b| b == b'\n').count() > n {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    // first line may be cut in half when we stopped mid-file
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let records: Vec<&str> = lines
        .into_iter()
        .filter(|l| !l.trim().is_empty() && *l != header)
        .collect();
    let skip = records.len().saturating_sub(n);
    Ok(records[skip..].iter().map(|l| l.to_string()).collect())
}

/// Replaces the file with `header` + `lines` via a synced sibling temp file
/// and a rename, so readers see either the old or the new contents.
pub fn rewrite_atomically(path: &Path, header: &str, lines: &[String]) -> io::Result<()> {
    ensure_parent(path)?;
    let tmp = tmp_path(path);

    let mut buf = String::with_capacity(header.len() + 1 + lines.len() * 32);
    buf.push_str(header);
    buf.push('\n');
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }

    {
        let mut file = File::create(&tmp)?;
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    debug!(path = %path.display(), records = lines.len(), "file rewritten");
    Ok(())
}

fn ensure_header<F>(path: &Path, header: &str, is_record: F) -> io::Result<()>
where
    F: Fn(&str) -> bool,
{
    let first = match File::open(path) {
        Ok(file) => {
            let mut first = String::new();
            BufReader::new(file).read_line(&mut first)?;
            first
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    if first.trim_end_matches(['\r', '\n']) == header {
        return Ok(());
    }

    let contents = fs::read_to_string(path).or_else(|e| match e.kind() {
        io::ErrorKind::NotFound => Ok(String::new()),
        _ => Err(e),
    })?;
    if contents.trim().is_empty() {
        let mut file = File::create(path)?;
        file.write_all(format!("{header}\n").as_bytes())?;
        return Ok(());
    }

    let mut lines = contents.lines();
    let first = lines.next().unwrap_or_default();
    info!(path = %path.display(), found = first, "header mismatch; migrating file");
    let mut body: Vec<String> = Vec::new();
    if is_record(first) {
        body.push(first.to_string());
    }
    body.extend(
        lines
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string),
    );
    rewrite_atomically(path, header, &body)
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
