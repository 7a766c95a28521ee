//! Flat per-run reports and Graphviz dumps of the explored graphs.
//!
//! A session appends one line per finished run to up to three streams and
//! rewrites two `.dot` files periodically and at teardown. Write failures are
//! reported through the log and never fail the session.

use core::fmt;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use libafl_bolts::Error;

use crate::{
    cfg::HighLevelCfg,
    engine::InputAssignment,
    tree::ExecutionTree,
};

/// The per-run report streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStream {
    /// Every finished run.
    AllRuns,
    /// Runs that reached a tree node no earlier run reached.
    NewPaths,
    /// New-path runs that also grew the CFG.
    CfgFragments,
}

impl fmt::Display for ReportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllRuns => write!(f, "all-runs"),
            Self::NewPaths => write!(f, "new-paths"),
            Self::CfgFragments => write!(f, "cfg-fragments"),
        }
    }
}

/// The report sinks of one session.
#[derive(Debug)]
pub struct RunReports {
    dir: Option<PathBuf>,
    all_runs: Option<BufWriter<File>>,
    new_paths: Option<BufWriter<File>>,
    cfg_fragments: Option<BufWriter<File>>,
}

impl RunReports {
    /// Open the three run streams under `dir`, creating it if needed.
    pub fn create(dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        let open = |name: &str| -> Result<BufWriter<File>, Error> {
            Ok(BufWriter::new(File::create(dir.join(name))?))
        };
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            all_runs: Some(open("all_runs.log")?),
            new_paths: Some(open("new_paths.log")?),
            cfg_fragments: Some(open("cfg_fragments.log")?),
        })
    }

    /// Reports that drop everything, for when the output directory cannot be
    /// opened.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dir: None,
            all_runs: None,
            new_paths: None,
            cfg_fragments: None,
        }
    }

    /// Append one run line to `stream`:
    /// `<relative-seconds> <starting-pc> <var>=><hex-bytes> ...`.
    ///
    /// Failures are logged and swallowed.
    pub fn log_run(
        &mut self,
        stream: ReportStream,
        relative: Duration,
        starting_pc: u64,
        assignment: &InputAssignment,
    ) {
        let writer = match stream {
            ReportStream::AllRuns => &mut self.all_runs,
            ReportStream::NewPaths => &mut self.new_paths,
            ReportStream::CfgFragments => &mut self.cfg_fragments,
        };
        let Some(writer) = writer else {
            return;
        };
        let mut line = format!(
            "{}.{:03} {starting_pc:#x}",
            relative.as_secs(),
            relative.subsec_millis()
        );
        for (name, bytes) in assignment {
            line.push(' ');
            line.push_str(name);
            line.push_str("=>");
            for byte in bytes {
                line.push_str(&format!("{byte:02x}"));
            }
        }
        // flush per line so a crashed engine leaves a readable report behind
        if let Err(err) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            log::warn!("failed to append to the {stream} report: {err}");
        }
    }

    /// Rewrite both graph dumps from the current tree and CFG.
    pub fn dump_graphs(&self, cfg: &HighLevelCfg, tree: &ExecutionTree) -> Result<(), Error> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::write(dir.join("execution_tree.dot"), tree_dot(tree, cfg))?;
        fs::write(dir.join("cfg.dot"), cfg_dot(cfg))?;
        Ok(())
    }
}

fn cfg_dot(cfg: &HighLevelCfg) -> String {
    let mut dot = String::from("digraph cfg {\n");
    for (id, inst) in cfg.iter() {
        dot.push_str(&format!(
            "\t\"{id}\"[label=\"{} op={:#x} paths={}/{} dist={}\"]\n",
            inst.pc(),
            inst.opcode(),
            inst.high_level_paths(),
            inst.low_level_paths(),
            inst.distance_to_uncovered(),
        ));
        let mut successors: Vec<_> = inst.successors().iter().copied().collect();
        successors.sort_unstable();
        for succ in successors {
            dot.push_str(&format!("\t\"{id}\" -> \"{succ}\"\n"));
        }
    }
    dot.push('}');
    dot
}

fn tree_dot(tree: &ExecutionTree, cfg: &HighLevelCfg) -> String {
    let mut dot = String::from("digraph execution_tree {\n");
    for (id, node) in tree.iter() {
        dot.push_str(&format!(
            "\t\"{id}\"[label=\"{} paths={} forks={}\"]\n",
            cfg.instruction(node.instruction()).pc(),
            node.path_counter(),
            node.fork_counter(),
        ));
        let mut children: Vec<_> = node.children().values().copied().collect();
        children.sort_unstable();
        for child in children {
            dot.push_str(&format!("\t\"{id}\" -> \"{child}\"\n"));
        }
    }
    dot.push('}');
    dot
}
