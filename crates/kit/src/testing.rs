//! In-process stand-in for the host used by unit tests.
//!
//! Records every command, keeps a simulated mount table, and fails commands
//! matching registered predicates. Unmounting a target clears the
//! directory's contents, as the real unmount would hide the filesystem.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;

use crate::mounts::MountTable;
use crate::runner::{CommandError, CommandLine, CommandOutput, CommandRunner};

type Predicate = Box<dyn Fn(&CommandLine) -> bool>;

#[derive(Default)]
struct State {
    log: Vec<CommandLine>,
    mounted: BTreeSet<Utf8PathBuf>,
    /// Targets that refuse a plain unmount this many more times.
    busy: BTreeMap<Utf8PathBuf, u32>,
    failures: Vec<(Predicate, i32)>,
    lazy_fails: BTreeSet<Utf8PathBuf>,
}

#[derive(Default)]
pub(crate) struct FakeHost {
    state: RefCell<State>,
}

impl std::fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("FakeHost")
            .field("commands", &state.log.len())
            .field("mounted", &state.mounted)
            .finish()
    }
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next command matching `pred` with exit status `code`.
    pub(crate) fn fail_when(&self, code: i32, pred: impl Fn(&CommandLine) -> bool + 'static) {
        self.state.borrow_mut().failures.push((Box::new(pred), code));
    }

    /// Fail the next command whose program is `program`.
    pub(crate) fn fail_program(&self, program: &'static str, code: i32) {
        self.fail_when(code, move |c| c.program() == Some(program));
    }

    /// Report `target` busy for the next `times` graceful unmounts.
    pub(crate) fn set_busy(&self, target: impl Into<Utf8PathBuf>, times: u32) {
        self.state.borrow_mut().busy.insert(target.into(), times);
    }

    /// Make even a lazy unmount of `target` fail.
    pub(crate) fn set_stuck(&self, target: impl Into<Utf8PathBuf>) {
        let target = target.into();
        let mut state = self.state.borrow_mut();
        state.busy.insert(target.clone(), u32::MAX);
        state.lazy_fails.insert(target);
    }

    /// Pretend `target` is already mounted.
    pub(crate) fn premount(&self, target: impl Into<Utf8PathBuf>) {
        self.state.borrow_mut().mounted.insert(target.into());
    }

    pub(crate) fn mounted(&self) -> Vec<Utf8PathBuf> {
        self.state.borrow().mounted.iter().cloned().collect()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.state.borrow().log.iter().map(|c| c.to_string()).collect()
    }

    pub(crate) fn recorded(&self) -> Vec<CommandLine> {
        self.state.borrow().log.clone()
    }

    pub(crate) fn programs(&self) -> Vec<String> {
        self.state
            .borrow()
            .log
            .iter()
            .filter_map(|c| c.program().map(ToOwned::to_owned))
            .collect()
    }

    fn simulate(&self, cmd: &CommandLine) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let target = cmd.argv.last().map(Utf8PathBuf::from);
        match (cmd.program(), target) {
            (Some("mount"), Some(target)) => {
                state.mounted.insert(target);
            }
            (Some("umount"), Some(target)) => {
                if !state.mounted.contains(&target) {
                    return CommandOutput::failed(32, format!("umount: {target}: not mounted."));
                }
                let lazy = cmd.argv.iter().any(|a| a == "-l");
                if lazy {
                    if state.lazy_fails.contains(&target) {
                        return CommandOutput::failed(32, format!("umount: {target}: stuck"));
                    }
                } else if let Some(n) = state.busy.get_mut(&target) {
                    if *n > 0 {
                        *n -= 1;
                        return CommandOutput::failed(32, format!("umount: {target}: target is busy."));
                    }
                }
                state.mounted.remove(&target);
                clear_dir(&target);
            }
            _ => {}
        }
        CommandOutput::success()
    }
}

fn clear_dir(dir: &Utf8Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let _ = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
    }
}

impl CommandRunner for FakeHost {
    fn execute(&self, cmd: &CommandLine) -> std::result::Result<CommandOutput, CommandError> {
        self.state.borrow_mut().log.push(cmd.clone());
        let failure = {
            let state = self.state.borrow();
            state
                .failures
                .iter()
                .position(|(pred, _)| pred(cmd))
                .map(|i| (i, state.failures[i].1))
        };
        if let Some((i, code)) = failure {
            drop(self.state.borrow_mut().failures.remove(i));
            return Ok(CommandOutput::failed(code, "simulated failure"));
        }
        Ok(self.simulate(cmd))
    }
}

impl MountTable for FakeHost {
    fn targets(&self) -> Result<Vec<Utf8PathBuf>> {
        Ok(self.mounted())
    }
}

/// A scratch directory addressed with UTF-8 paths.
pub(crate) fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let td = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
    (td, path)
}
