//! In-process and kernel-loaded execution of real payloads

#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

mod common;

use std::time::{Duration, Instant};

use shellhost::engine::cancel::{CancelToken, WaitPolicy};
use shellhost::engine::native::{self, NativeExecutor};
use shellhost::engine::runner::Plan;
use shellhost::engine::ExitCode;
use shellhost::error::LoaderError;
use shellhost::image::loader::{ShellcodeImage, SourceFormat};
use shellhost::strategy::config::LoaderConfig;
use shellhost::strategy::selector::ExecutionStrategy;

use common::*;

#[cfg(target_arch = "x86_64")]
const ARCH: &str = "x86_64";
#[cfg(target_arch = "x86_64")]
const RETURN_42: &[u8] = X86_RETURN_42;
/// jmp $
#[cfg(target_arch = "x86_64")]
const SPIN: &[u8] = &[0xEB, 0xFE];

#[cfg(target_arch = "aarch64")]
const ARCH: &str = "aarch64";
#[cfg(target_arch = "aarch64")]
const RETURN_42: &[u8] = A64_RETURN_42;
/// b .
#[cfg(target_arch = "aarch64")]
const SPIN: &[u8] = &[0x00, 0x00, 0x00, 0x14];

fn unbounded() -> WaitPolicy {
    WaitPolicy::unbounded(CancelToken::new())
}

#[test]
fn test_native_payload_returns_42() {
    let image = ShellcodeImage::raw(RETURN_42.to_vec()).unwrap();
    assert_eq!(native::run(image, &unbounded()).unwrap(), ExitCode(42));
}

#[test]
fn test_native_honours_entry_offset() {
    // Anything before the entry would crash if executed
    let mut bytes = vec![0x00; 16];
    bytes.extend_from_slice(RETURN_42);
    let image = ShellcodeImage::new(bytes, 16, SourceFormat::Raw).unwrap();

    assert_eq!(native::run(image, &unbounded()).unwrap(), ExitCode(42));
}

#[test]
fn test_native_through_plan() {
    let config = LoaderConfig::default();
    let plan = Plan::detect(&config, ARCH, None).unwrap();
    assert_eq!(plan.strategy, ExecutionStrategy::NativeDirect);

    let image = ShellcodeImage::raw(RETURN_42.to_vec()).unwrap();
    let code = plan
        .execute_with(&NativeExecutor, image, &config, None, CancelToken::new())
        .unwrap();
    assert_eq!(code, ExitCode(42));
}

#[test]
fn test_native_repeated_runs() {
    for _ in 0..32 {
        let image = ShellcodeImage::raw(RETURN_42.to_vec()).unwrap();
        assert_eq!(native::run(image, &unbounded()).unwrap(), ExitCode(42));
    }
}

#[test]
fn test_native_timeout_returns() {
    let image = ShellcodeImage::raw(SPIN.to_vec()).unwrap();
    let wait = WaitPolicy::new(CancelToken::new(), Some(Duration::from_millis(100)));

    let started = Instant::now();
    let result = native::run(image, &wait);

    assert!(matches!(result, Err(LoaderError::TimedOut(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// mov edi, 42; mov eax, 60 (exit); syscall
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const EXIT_42: &[u8] = &[
    0xBF, 0x2A, 0x00, 0x00, 0x00, 0xB8, 0x3C, 0x00, 0x00, 0x00, 0x0F, 0x05,
];

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run_relocated(
    image: ShellcodeImage,
    source: Option<&std::path::Path>,
) -> shellhost::Result<ExitCode> {
    use shellhost::engine::relocate::RelocateExecutor;
    use shellhost::engine::{ExecutionContext, Executor};
    use shellhost::platform::host::OperatingSystem;
    use shellhost::strategy::selector::Target;

    let config = LoaderConfig::default();
    let arch = config.catalog.lookup("x86_64")?;
    let ctx = ExecutionContext {
        target: Target::new(arch, OperatingSystem::Linux),
        config: &config,
        wait: unbounded(),
        source,
    };
    RelocateExecutor.execute(image, &ctx)
}

// Both cases share one test so no other exec races the container's write descriptor
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn test_relocated_container_exit_code() {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use shellhost::image::container::build_elf;
    use shellhost::image::loader::{load_image, InputFormat};
    use shellhost::platform::catalog::Catalog;

    // Raw blob wrapped into a generated container
    let image = ShellcodeImage::raw(EXIT_42.to_vec()).unwrap();
    assert_eq!(run_relocated(image, None).unwrap(), ExitCode(42));

    // ELF input named relative to the working directory, without the execute bit
    let catalog = Catalog::builtin();
    let arch = catalog.lookup("x86_64").unwrap();
    let elf = build_elf(&ShellcodeImage::raw(EXIT_42.to_vec()).unwrap(), arch);

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("payload.elf");
    std::fs::write(&file, elf).unwrap();
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let source = Path::new("payload.elf");
    let result = load_image(source, InputFormat::Auto, false).and_then(|image| {
        assert!(matches!(image.format(), SourceFormat::Elf { .. }));
        run_relocated(image, Some(source))
    });
    std::env::set_current_dir(previous).unwrap();

    assert_eq!(result.unwrap(), ExitCode(42));
}
