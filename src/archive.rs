//! XZ archive extraction. Decompression always streams into a sibling
//! temporary file and renames over the target, so a failed extraction never
//! disturbs the destination.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use xz2::read::XzDecoder;

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Stream-decompress the XZ stream at `archive` into `target`. The target is
/// replaced atomically after the full stream decoded; no metadata is
/// preserved.
pub fn extract_xz<P: AsRef<Path>, Q: AsRef<Path>>(archive: P, target: Q) -> io::Result<()> {
    let target = target.as_ref();
    let tmp = tmp_path(target);

    let input = File::open(archive)?;
    let mut decoder = XzDecoder::new(input);
    let result = File::create(&tmp).and_then(|mut output| io::copy(&mut decoder, &mut output));
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(&tmp, target)
}

/// Replace the XZ archive at `path` with its decompressed content.
pub fn extract_xz_in_place<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();
    extract_xz(path, path)
}
