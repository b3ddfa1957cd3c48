//! Flash Controller
//!
//! Converts the firmware image into the programmer's native binary and drives the
//! debug probe through init, halt, program, verify, reset and release.
//! A failed flash is never retried: the device state is unknown afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::tools::{self, ToolCommand, ToolError};
use super::uf2::{Uf2Error, Uf2Image};
use super::verify;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Invalid UF2 image: {0}")]
    Uf2(#[from] Uf2Error),
    #[error("Unsupported image type: {}", .0.display())]
    Unsupported(PathBuf),
    #[error("Converter failed: {0}")]
    Tool(#[from] ToolError),
    #[error("Converter produced no output at {}", .0.display())]
    NoOutput(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("Programmer failed: {0}")]
    Tool(#[from] ToolError),
    #[error("Programmer rejected job: {0}")]
    Rejected(String),
}

/// Binary ready for the programmer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedImage {
    pub path: PathBuf,
    /// Load address carried by the source format, if any
    pub base_address: Option<u32>,
}

/// Debug-interface wiring and chip profile handed to the programmer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammerTarget {
    /// Interface configuration naming the probe and its pin mapping
    pub interface: String,
    /// Target chip profile
    pub target: String,
    pub adapter_speed_khz: Option<u32>,
}

/// Everything the programmer needs for one flash attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashJob {
    pub binary: PathBuf,
    pub address: u32,
    pub target: ProgrammerTarget,
}

pub trait ImageConverter: Send + Sync {
    fn convert(&self, image: &Path, out_dir: &Path) -> Result<ConvertedImage, ConvertError>;
}

pub trait Programmer: Send + Sync {
    fn program(&self, job: &FlashJob) -> Result<(), ProgramError>;
}

/// In-process conversion: UF2 is flattened, raw binaries pass through
pub struct NativeConverter;

impl ImageConverter for NativeConverter {
    fn convert(&self, image: &Path, out_dir: &Path) -> Result<ConvertedImage, ConvertError> {
        let extension = image
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let output = out_dir.join("firmware.bin");

        match extension.as_deref() {
            Some("uf2") => {
                let parsed = Uf2Image::parse(&fs::read(image)?)?;
                if let Some(family) = parsed.family_id() {
                    tracing::debug!(family = %format!("{:#010x}", family), "UF2 family");
                }
                fs::write(&output, parsed.to_binary()?)?;
                Ok(ConvertedImage {
                    path: output,
                    base_address: Some(parsed.base_address()),
                })
            }
            Some("bin") => {
                fs::copy(image, &output)?;
                Ok(ConvertedImage {
                    path: output,
                    base_address: None,
                })
            }
            _ => Err(ConvertError::Unsupported(image.to_path_buf())),
        }
    }
}

/// Conversion delegated to an external tool
///
/// `{input}` and `{output}` in the argument template are substituted.
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self { program, args, timeout }
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{input}", &input.display().to_string())
                    .replace("{output}", &output.display().to_string())
            })
            .collect()
    }
}

impl ImageConverter for CommandConverter {
    fn convert(&self, image: &Path, out_dir: &Path) -> Result<ConvertedImage, ConvertError> {
        let output = out_dir.join("firmware.bin");
        if output.exists() {
            fs::remove_file(&output)?;
        }

        let program = tools::locate(&self.program)?;
        ToolCommand::new(program, self.timeout)
            .args(self.render_args(image, &output))
            .run()?;

        if !output.is_file() {
            return Err(ConvertError::NoOutput(output));
        }
        Ok(ConvertedImage {
            path: output,
            base_address: None,
        })
    }
}

/// OpenOCD driven through its command line
pub struct OpenOcdProgrammer {
    program: String,
    timeout: Duration,
}

impl OpenOcdProgrammer {
    pub fn new(program: String, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    fn arguments(job: &FlashJob) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            format!("interface/{}.cfg", job.target.interface),
            "-f".to_string(),
            format!("target/{}.cfg", job.target.target),
        ];
        if let Some(khz) = job.target.adapter_speed_khz {
            args.push("-c".to_string());
            args.push(format!("adapter speed {}", khz));
        }
        for command in [
            "init".to_string(),
            "reset halt".to_string(),
            format!("program {{{}}} {:#010x} verify", job.binary.display(), job.address),
            "reset".to_string(),
            "shutdown".to_string(),
        ] {
            args.push("-c".to_string());
            args.push(command);
        }
        args
    }
}

impl Programmer for OpenOcdProgrammer {
    fn program(&self, job: &FlashJob) -> Result<(), ProgramError> {
        if !job.binary.is_file() {
            return Err(ProgramError::Rejected(format!("binary {} missing", job.binary.display())));
        }
        let program = tools::locate(&self.program)?;
        let output = ToolCommand::new(program, self.timeout)
            .args(Self::arguments(job))
            .run()?;

        // OpenOCD logs to stderr even on success
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::debug!(target: "fwsync::openocd", "{}", line);
        }
        Ok(())
    }
}

pub struct FlashController<'a> {
    converter: &'a dyn ImageConverter,
    programmer: &'a dyn Programmer,
    target: ProgrammerTarget,
    default_address: u32,
    work_dir: &'a Path,
}

impl<'a> FlashController<'a> {
    pub fn new(
        converter: &'a dyn ImageConverter,
        programmer: &'a dyn Programmer,
        target: ProgrammerTarget,
        default_address: u32,
        work_dir: &'a Path,
    ) -> Self {
        Self {
            converter,
            programmer,
            target,
            default_address,
            work_dir,
        }
    }

    /// Convert then program; never touches persisted version state
    pub fn flash(&self, image: &Path) -> Result<(), FlashFailure> {
        fs::create_dir_all(self.work_dir).map_err(|e| FlashFailure::Conversion(e.into()))?;

        let converted = self
            .converter
            .convert(image, self.work_dir)
            .map_err(FlashFailure::Conversion)?;
        let digest = verify::file_sha256_hex(&converted.path).map_err(|e| FlashFailure::Conversion(e.into()))?;

        let job = FlashJob {
            binary: converted.path,
            address: converted.base_address.unwrap_or(self.default_address),
            target: self.target.clone(),
        };
        tracing::info!(
            binary = %job.binary.display(),
            address = %format!("{:#010x}", job.address),
            sha256 = %digest,
            interface = %job.target.interface,
            target = %job.target.target,
            "Programming device"
        );

        let result = self.programmer.program(&job);
        // The job is discarded once the programmer reports a terminal result
        if let Err(e) = fs::remove_file(&job.binary) {
            tracing::debug!(binary = %job.binary.display(), error = %e, "Could not remove converted binary");
        }

        result.map_err(FlashFailure::Program)?;
        tracing::info!("Device programmed and verified");
        Ok(())
    }
}

/// Which half of the flash step failed
#[derive(Debug)]
pub enum FlashFailure {
    Conversion(ConvertError),
    Program(ProgramError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::testing::RecordingProgrammer;
    use crate::engine::updater::uf2;
    use tempfile::tempdir;

    fn target() -> ProgrammerTarget {
        ProgrammerTarget {
            interface: "raspberrypi-swd".to_string(),
            target: "rp2040".to_string(),
            adapter_speed_khz: None,
        }
    }

    #[test]
    fn test_native_uf2_conversion() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.uf2");
        fs::write(&image, uf2::encode(&[0xAB; 300], 0x1000_0000, None)).unwrap();

        let converted = NativeConverter.convert(&image, dir.path()).unwrap();
        assert_eq!(converted.base_address, Some(0x1000_0000));
        assert_eq!(fs::read(&converted.path).unwrap(), vec![0xAB; 300]);
    }

    #[test]
    fn test_native_rejects_unknown_extension() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.hex");
        fs::write(&image, b":00000001FF").unwrap();
        assert!(matches!(
            NativeConverter.convert(&image, dir.path()),
            Err(ConvertError::Unsupported(_))
        ));
    }

    #[test]
    fn test_openocd_command_sequence() {
        let job = FlashJob {
            binary: PathBuf::from("/tmp/fw.bin"),
            address: 0x1000_0000,
            target: ProgrammerTarget {
                adapter_speed_khz: Some(1000),
                ..target()
            },
        };
        let args = OpenOcdProgrammer::arguments(&job);
        assert_eq!(
            args,
            vec![
                "-f",
                "interface/raspberrypi-swd.cfg",
                "-f",
                "target/rp2040.cfg",
                "-c",
                "adapter speed 1000",
                "-c",
                "init",
                "-c",
                "reset halt",
                "-c",
                "program {/tmp/fw.bin} 0x10000000 verify",
                "-c",
                "reset",
                "-c",
                "shutdown",
            ]
        );
    }

    #[test]
    fn test_command_converter_template() {
        let converter = CommandConverter::new(
            "uf2conv.py".to_string(),
            vec!["{input}".into(), "--convert".into(), "--output".into(), "{output}".into()],
            Duration::from_secs(5),
        );
        let args = converter.render_args(Path::new("/s/fw.uf2"), Path::new("/w/firmware.bin"));
        assert_eq!(args, vec!["/s/fw.uf2", "--convert", "--output", "/w/firmware.bin"]);
    }

    #[test]
    fn test_flash_uses_image_address_and_discards_job() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.uf2");
        fs::write(&image, uf2::encode(&[1; 10], 0x1000_0100, None)).unwrap();
        let work = dir.path().join("work");
        let programmer = RecordingProgrammer::succeeding();

        FlashController::new(&NativeConverter, &programmer, target(), 0x1000_0000, &work)
            .flash(&image)
            .unwrap();

        let jobs = programmer.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].address, 0x1000_0100);
        assert!(!jobs[0].binary.exists());
    }

    /// Takes ownership of the binary, as some probe front-ends do
    struct ConsumingProgrammer;

    impl Programmer for ConsumingProgrammer {
        fn program(&self, job: &FlashJob) -> Result<(), ProgramError> {
            fs::remove_file(&job.binary).map_err(|e| ProgramError::Rejected(e.to_string()))
        }
    }

    #[test]
    fn test_cleanup_failure_does_not_fail_flash() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.bin");
        fs::write(&image, [3u8; 8]).unwrap();
        let work = dir.path().join("work");

        let result = FlashController::new(&NativeConverter, &ConsumingProgrammer, target(), 0, &work).flash(&image);
        assert!(result.is_ok());
    }

    #[test]
    fn test_raw_binary_uses_default_address() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.bin");
        fs::write(&image, [2u8; 8]).unwrap();
        let work = dir.path().join("work");
        let programmer = RecordingProgrammer::succeeding();

        FlashController::new(&NativeConverter, &programmer, target(), 0x1000_0000, &work)
            .flash(&image)
            .unwrap();
        assert_eq!(programmer.jobs()[0].address, 0x1000_0000);
    }

    #[test]
    fn test_programmer_failure_surfaces() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.bin");
        fs::write(&image, [2u8; 8]).unwrap();
        let work = dir.path().join("work");
        let programmer = RecordingProgrammer::failing();

        let result = FlashController::new(&NativeConverter, &programmer, target(), 0, &work).flash(&image);
        assert!(matches!(result, Err(FlashFailure::Program(_))));
        assert_eq!(programmer.jobs().len(), 1);
    }

    #[test]
    fn test_conversion_failure_never_programs() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("fw.uf2");
        fs::write(&image, b"not a uf2").unwrap();
        let work = dir.path().join("work");
        let programmer = RecordingProgrammer::succeeding();

        let result = FlashController::new(&NativeConverter, &programmer, target(), 0, &work).flash(&image);
        assert!(matches!(result, Err(FlashFailure::Conversion(_))));
        assert!(programmer.jobs().is_empty());
    }
}
