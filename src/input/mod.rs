//! Audio byte sources and the external transcoder boundary.
//!
//! The session core never encodes or decodes Opus itself: a transcoder
//! executable (the `dca` family of tools, or anything speaking the same
//! contract) is resolved on `PATH` and run as a child process. Encoders emit
//! 16-bit-LE-length-prefixed Opus frames at 20 ms cadence on stdout;
//! decoders accept the same framing on stdin and emit raw s16-LE PCM.

mod child;

pub use child::ChildContainer;

use std::{
    fmt,
    io::{Error as IoError, ErrorKind, Read, Result as IoResult},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

/// A byte source handed to [`Driver::play`].
///
/// [`Driver::play`]: crate::driver::Driver::play
pub enum AudioSource {
    /// A container/file on disk, passed to the transcoder to demux and
    /// encode.
    File(PathBuf),
    /// A live stream of raw s16-LE 48 kHz stereo PCM, piped through the
    /// gain stage into the transcoder's stdin.
    Pcm(Box<dyn Read + Send + 'static>),
}

impl AudioSource {
    /// Wraps a reader of raw s16-LE 48 kHz stereo PCM.
    #[must_use]
    pub fn pcm<R: Read + Send + 'static>(reader: R) -> Self {
        Self::Pcm(Box::new(reader))
    }

    /// Wraps a file path.
    #[must_use]
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File(path.into())
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Pcm(_) => f.write_str("Pcm(..)"),
        }
    }
}

/// Names and argument shape of the transcoder executable.
#[derive(Clone, Debug)]
pub struct Transcoder {
    /// Executable name resolved against `PATH`.
    pub executable: String,
    /// Arguments for encode mode (input appended as `-i <source>`).
    pub encode_args: Vec<String>,
    /// Arguments for decode mode (framed Opus on stdin, PCM on stdout).
    pub decode_args: Vec<String>,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self {
            executable: "dca".into(),
            encode_args: Vec::new(),
            decode_args: vec!["--decode".into()],
        }
    }
}

/// Pipes of a spawned encoder child.
pub(crate) struct EncoderStreams {
    pub container: ChildContainer,
    pub stdout: ChildStdout,
    pub stdin: Option<ChildStdin>,
}

/// Pipes of a spawned decoder child.
pub(crate) struct DecoderStreams {
    pub container: ChildContainer,
    pub stdout: ChildStdout,
    pub stdin: ChildStdin,
}

impl Transcoder {
    /// Locates the transcoder on `PATH`, if present.
    #[must_use]
    pub fn resolve(&self) -> Option<PathBuf> {
        resolve_executable(&self.executable)
    }

    pub(crate) fn spawn_encoder(
        &self,
        exe: &Path,
        source: &AudioSource,
    ) -> IoResult<EncoderStreams> {
        let mut command = Command::new(exe);
        command
            .args(&self.encode_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        match source {
            AudioSource::File(path) => {
                command.arg("-i").arg(path).stdin(Stdio::null());
            },
            AudioSource::Pcm(_) => {
                command.args(["-i", "pipe:0"]).stdin(Stdio::piped());
            },
        }

        let mut child = command.spawn()?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stdin = child.stdin.take();

        Ok(EncoderStreams {
            container: ChildContainer::from(child),
            stdout,
            stdin,
        })
    }

    pub(crate) fn spawn_decoder(&self, exe: &Path) -> IoResult<DecoderStreams> {
        let mut child: Child = Command::new(exe)
            .args(&self.decode_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;

        Ok(DecoderStreams {
            container: ChildContainer::from(child),
            stdout,
            stdin,
        })
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> IoResult<T> {
    pipe.ok_or_else(|| IoError::new(ErrorKind::BrokenPipe, format!("transcoder lacks {name}")))
}

/// Finds `name` on `PATH` using the platform's own resolver: `command -v`
/// through a shell on POSIX systems, `where` on Windows.
#[must_use]
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    let output = if cfg!(windows) {
        Command::new("where").arg(name).output()
    } else {
        Command::new("sh")
            .arg("-c")
            .arg(format!("command -v -- {name}"))
            .output()
    }
    .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
}

/// Reads 16-bit-LE-length-prefixed frames from a byte stream.
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a byte stream emitting length-prefixed frames.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame into `buf`, returning its length, or `None` at
    /// a clean end of stream.
    ///
    /// A stream ending inside a prefix or frame body is an error: the child
    /// died mid-frame.
    pub fn next_frame(&mut self, buf: &mut Vec<u8>) -> IoResult<Option<usize>> {
        let mut prefix = [0u8; 2];

        loop {
            match self.inner.read(&mut prefix[..1]) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        self.inner.read_exact(&mut prefix[1..])?;

        let len = i16::from_le_bytes(prefix);
        if len <= 0 {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("bad frame length prefix {len}"),
            ));
        }

        let len = len as usize;
        buf.resize(len, 0);
        self.inner.read_exact(&mut buf[..len])?;

        Ok(Some(len))
    }
}

/// Scales a buffer of s16-LE samples by `gain`, clamping to the sample range.
pub fn apply_gain(pcm: &mut [u8], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }

    for sample in pcm.chunks_exact_mut(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        let scaled = (f32::from(value) * gain)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        sample.copy_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_reader_walks_frames() {
        let bytes = [3u8, 0, 1, 2, 3, 2, 0, 9, 9];
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut buf = Vec::new();

        assert_eq!(reader.next_frame(&mut buf).unwrap(), Some(3));
        assert_eq!(buf, vec![1, 2, 3]);
        assert_eq!(reader.next_frame(&mut buf).unwrap(), Some(2));
        assert_eq!(buf[..2], [9, 9]);
        assert_eq!(reader.next_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn frame_reader_rejects_torn_streams() {
        let mut reader = FrameReader::new(Cursor::new([3u8, 0, 1]));
        let mut buf = Vec::new();
        let err = reader.next_frame(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn frame_reader_rejects_nonpositive_lengths() {
        let mut reader = FrameReader::new(Cursor::new([0u8, 0]));
        let mut buf = Vec::new();
        let err = reader.next_frame(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn gain_scales_and_clamps() {
        let samples: Vec<u8> = [1000i16, -1000, 32000, -32000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();

        let mut doubled = samples.clone();
        apply_gain(&mut doubled, 2.0);
        let out: Vec<i16> = doubled
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(out, vec![2000, -2000, i16::MAX, i16::MIN]);

        let mut halved = samples.clone();
        apply_gain(&mut halved, 0.5);
        let out: Vec<i16> = halved
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(out, vec![500, -500, 16000, -16000]);
    }

    #[cfg(unix)]
    #[test]
    fn resolver_finds_real_tools_only() {
        assert!(resolve_executable("sh").is_some());
        assert!(resolve_executable("surely-not-a-real-executable-0x7f").is_none());
    }
}
