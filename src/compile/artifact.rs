use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bincode::Options;
use rhai::AST;
use serde::{Deserialize, Serialize};

use super::libraries::Library;
use crate::error::ScriptError;

const FRAME_LEN_BYTES: usize = 4;
pub const IMAGE_FORMAT: u32 = 1;

/// What goes on disk for one compiled module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactImage {
    pub format: u32,
    pub entry_type: String,
    pub libraries: Vec<Library>,
    pub digest: String,
    pub source: String,
}

/// A compiled module: its files on disk plus the parsed script shared by every instance.
#[derive(Debug)]
pub struct CompiledArtifact {
    path: PathBuf,
    source_path: PathBuf,
    mirror_path: PathBuf,
    entry_type: String,
    libraries: Vec<Library>,
    digest: blake3::Hash,
    ast: Arc<AST>,
}

impl CompiledArtifact {
    pub fn new(
        path: PathBuf,
        source_path: PathBuf,
        entry_type: String,
        libraries: Vec<Library>,
        digest: blake3::Hash,
        ast: AST,
    ) -> Self {
        let mirror_path = mirror_path(&path);
        Self { path, source_path, mirror_path, entry_type, libraries, digest, ast: Arc::new(ast) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror_path
    }

    pub fn entry_type(&self) -> &str {
        &self.entry_type
    }

    pub fn libraries(&self) -> &[Library] {
        &self.libraries
    }

    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    pub fn ast(&self) -> Arc<AST> {
        self.ast.clone()
    }

    pub fn is_on_disk(&self) -> bool {
        self.path.is_file()
    }

    /// Deletes the artifact, its source copy and its mirror. Failures are only logged.
    pub fn remove_files(&self) {
        remove_files(&self.path, &self.source_path);
    }
}

pub fn mirror_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".b64");
    PathBuf::from(name)
}

pub(crate) fn remove_files(artifact: &Path, source: &Path) {
    for path in [artifact.to_path_buf(), source.to_path_buf(), mirror_path(artifact)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("[mrm] could not delete '{}': {err}", path.display()),
        }
    }
}

pub fn write_image(path: &Path, image: &ArtifactImage) -> Result<(), ScriptError> {
    let mut buffer = Vec::new();
    send_frame(&mut buffer, image).map_err(|err| ScriptError::artifact_io(path, err))?;
    fs::write(path, buffer).map_err(|err| ScriptError::artifact_io(path, err))
}

/// Reads an image back. A missing file is reported as such, not as an I/O failure.
pub fn read_image(path: &Path) -> Result<(Vec<u8>, ArtifactImage), ScriptError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ScriptError::ArtifactMissing(path.to_path_buf()))
        }
        Err(err) => return Err(ScriptError::artifact_io(path, err)),
    };
    let image = recv_frame(&mut Cursor::new(&bytes)).map_err(|err| ScriptError::artifact_io(path, err))?;
    Ok((bytes, image))
}

pub fn write_mirror(artifact: &Path, bytes: &[u8]) -> Result<PathBuf, ScriptError> {
    let path = mirror_path(artifact);
    fs::write(&path, BASE64.encode(bytes)).map_err(|err| ScriptError::artifact_io(&path, err))?;
    Ok(path)
}

fn send_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    let payload = bincode_options().serialize(value).map_err(to_io_error)?;
    let len = u32::try_from(payload.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "image too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

fn recv_frame<R: Read, T: serde::de::DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; FRAME_LEN_BYTES];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    bincode_options().deserialize(&payload).map_err(to_io_error)
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

fn to_io_error(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image() -> ArtifactImage {
        ArtifactImage {
            format: IMAGE_FORMAT,
            entry_type: "demo.Greeter".into(),
            libraries: Library::BASELINE.to_vec(),
            digest: blake3::hash(b"source").to_hex().to_string(),
            source: "//MRM:rhai\n".into(),
        }
    }

    #[test]
    fn image_survives_disk_and_mirror_decodes_to_same_bytes() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("minimodule_compiled_x_1.artifact");
        write_image(&path, &image()).expect("write image");
        let (bytes, read) = read_image(&path).expect("read image");
        assert_eq!(read, image());

        let mirror = write_mirror(&path, &bytes).expect("write mirror");
        assert_eq!(mirror, dir.path().join("minimodule_compiled_x_1.artifact.b64"));
        let encoded = fs::read_to_string(&mirror).expect("read mirror");
        assert_eq!(BASE64.decode(encoded).expect("valid base64"), bytes);
    }

    #[test]
    fn missing_image_is_reported_as_missing() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("absent.artifact");
        assert_eq!(read_image(&path).err(), Some(ScriptError::ArtifactMissing(path)));
    }

    #[test]
    fn truncated_image_is_an_io_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("short.artifact");
        fs::write(&path, [9u8, 0, 0, 0, 1]).expect("write");
        assert!(matches!(read_image(&path), Err(ScriptError::ArtifactIo { .. })));
    }

    #[test]
    fn remove_files_tolerates_missing_files() {
        let dir = tempdir().expect("temp dir");
        let artifact = dir.path().join("a.artifact");
        let source = dir.path().join("a.rhai");
        fs::write(&artifact, b"x").expect("write");
        remove_files(&artifact, &source);
        assert!(!artifact.exists());
    }
}
