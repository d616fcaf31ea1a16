//! Streaming gzip for backup artifacts.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Gzip `src` into `dest`; returns the compressed size.
pub fn gzip_file(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(src)?);
    let writer = BufWriter::new(File::create(dest)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(std::fs::metadata(dest)?.len())
}

/// Decompress `src` into a temporary file next to it, named
/// `<src>.verify-XXXXXX.partial`. The file is removed when the returned
/// handle drops.
pub fn gunzip_to_temp(src: &Path) -> io::Result<NamedTempFile> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let dir = src.parent().unwrap_or_else(|| Path::new("."));
    let mut prefix = src.file_name().unwrap_or_default().to_os_string();
    prefix.push(".verify-");
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".partial")
        .tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
    }
    Ok(tmp)
}

/// `1 - compressed / original`; 0 for an empty original.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compression_ratio(original: u64, compressed: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        1.0 - compressed as f64 / original as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_then_gunzip_restores_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.bin");
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 7) as u8).collect();
        std::fs::write(&src, &payload).unwrap();

        let gz = dir.path().join("plain.bin.gz");
        let size = gzip_file(&src, &gz).unwrap();
        assert!(size > 0 && size < payload.len() as u64);

        let tmp = gunzip_to_temp(&gz).unwrap();
        let tmp_name = tmp.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(tmp_name.starts_with("plain.bin.gz.verify-"), "{tmp_name}");
        assert!(tmp_name.ends_with(".partial"), "{tmp_name}");
        assert_eq!(std::fs::read(tmp.path()).unwrap(), payload);
        let tmp_path = tmp.path().to_path_buf();
        drop(tmp);
        assert!(!tmp_path.exists());
    }

    #[test]
    fn ratio_edges() {
        assert!(compression_ratio(0, 0).abs() < f64::EPSILON);
        assert!((compression_ratio(100, 25) - 0.75).abs() < 1e-12);
    }
}
