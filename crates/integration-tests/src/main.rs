use std::path::Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

mod tests {
    pub mod cleanup;
    pub mod preflight;
    pub mod run_vm;
}

/// Get the path to the labvm binary, checking LABVM_PATH env var first, then falling back to "labvm"
pub(crate) fn get_labvm_command() -> Result<String> {
    if let Ok(path) = std::env::var("LABVM_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/labvm", "target/release/labvm"]
        .into_iter()
        .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set LABVM_PATH={path} to run using this binary"
        ));
    }
    Ok("labvm".to_owned())
}

fn main() {
    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("preflight_exit_code_matches_report", || {
            tests::preflight::test_preflight_exit_code_matches_report()?;
            Ok(())
        }),
        Trial::test("preflight_json", || {
            tests::preflight::test_preflight_json()?;
            Ok(())
        }),
        Trial::test("cleanup_empty_workdir_is_idempotent", || {
            tests::cleanup::test_cleanup_empty_workdir_is_idempotent()?;
            Ok(())
        }),
        Trial::test("cleanup_resumes_from_journal", || {
            tests::cleanup::test_cleanup_resumes_from_journal()?;
            Ok(())
        }),
        Trial::test("run_without_image", || {
            tests::run_vm::test_run_without_image()?;
            Ok(())
        }),
    ];

    libtest_mimic::run(&args, tests).exit();
}
