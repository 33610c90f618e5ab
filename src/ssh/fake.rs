//! In-memory host used by stage tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::remote::{CommandOutput, Remote, HEREDOC_EOF};

struct Rule {
    pattern: String,
    outputs: VecDeque<CommandOutput>,
}

/// Answers commands from scripted rules. The most recently added rule whose
/// pattern is a substring of the command wins; a rule with several outputs
/// replays them in order and then repeats the last one. Heredoc writes and
/// transfers land in a file table that `cat` and `sudo cat` read back.
/// Anything else succeeds with empty output.
pub struct FakeHost {
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    broken_transfers: Mutex<bool>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            broken_transfers: Mutex::new(false),
        }
    }

    pub fn script(&self, pattern: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            outputs: outputs.into(),
        });
        self
    }

    pub fn on(&self, pattern: &str, stdout: &str) -> &Self {
        self.script(pattern, vec![CommandOutput::ok(stdout)])
    }

    pub fn fail(&self, pattern: &str) -> &Self {
        self.script(pattern, vec![CommandOutput::failed(1, "scripted failure")])
    }

    /// Fail the first time, succeed afterwards
    pub fn fail_once(&self, pattern: &str) -> &Self {
        self.script(
            pattern,
            vec![CommandOutput::failed(1, "scripted failure"), CommandOutput::ok("")],
        )
    }

    /// Transfers drop the connection halfway, leaving a partial remote file
    pub fn break_transfers(&self) -> &Self {
        *self.broken_transfers.lock().unwrap() = true;
        self
    }

    pub fn put_file(&self, path: &str, content: &str) -> &Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }

    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .position(|cmd| cmd.contains(pattern))
    }

    fn scripted(&self, cmd: &str) -> Option<CommandOutput> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().rev().find(|r| cmd.contains(&r.pattern))?;
        if rule.outputs.len() > 1 {
            rule.outputs.pop_front()
        } else {
            rule.outputs.front().cloned()
        }
    }

    fn heredoc_write(&self, cmd: &str) -> Option<CommandOutput> {
        let marker = format!(" << '{}'\n", HEREDOC_EOF);
        let (head, body) = cmd.split_once(&marker)?;
        let path = head
            .strip_prefix("sudo tee ")
            .map(|rest| rest.trim_end_matches(" > /dev/null"))
            .or_else(|| head.strip_prefix("cat > "))?;
        let content = body.strip_suffix(&format!("\n{}", HEREDOC_EOF))?;
        self.put_file(path.trim(), &format!("{}\n", content));
        Some(CommandOutput::ok(""))
    }

    fn cat(&self, cmd: &str) -> Option<CommandOutput> {
        let path = cmd
            .strip_prefix("sudo cat ")
            .or_else(|| cmd.strip_prefix("cat "))?;
        Some(match self.file(path.trim()) {
            Some(content) => CommandOutput::ok(content),
            None => CommandOutput::failed(1, format!("cat: {}: No such file or directory", path)),
        })
    }
}

#[async_trait]
impl Remote for FakeHost {
    fn host(&self) -> &str {
        "fake-host"
    }

    async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        self.history.lock().unwrap().push(cmd.to_string());

        Ok(self
            .scripted(cmd)
            .or_else(|| self.heredoc_write(cmd))
            .or_else(|| self.cat(cmd))
            .unwrap_or_default())
    }

    async fn transfer(&self, local: &Path, remote_path: &str) -> Result<()> {
        self.history
            .lock()
            .unwrap()
            .push(format!("transfer {} -> {}", local.display(), remote_path));
        let mut bytes = std::fs::read(local)
            .with_context(|| format!("fake transfer could not read {}", local.display()))?;
        if *self.broken_transfers.lock().unwrap() {
            bytes.truncate(bytes.len() / 2);
            self.files
                .lock()
                .unwrap()
                .insert(remote_path.to_string(), bytes);
            bail!("connection reset mid-stream");
        }
        self.files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), bytes);
        Ok(())
    }
}
