use anyhow::Result;
use dialoguer::{Input, Password};

/// Where values that cannot be generated come from
pub trait SecretSource {
    fn text(&mut self, prompt: &str, default: Option<&str>) -> Result<String>;

    /// Hidden input, never echoed
    fn password(&mut self, prompt: &str) -> Result<String>;
}

/// Interactive prompts on the operator's terminal
pub struct Terminal;

impl SecretSource for Terminal {
    fn text(&mut self, prompt: &str, default: Option<&str>) -> Result<String> {
        let mut input = Input::<String>::new().with_prompt(prompt);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        Ok(input.interact_text()?.trim().to_string())
    }

    fn password(&mut self, prompt: &str) -> Result<String> {
        Ok(Password::new()
            .with_prompt(prompt)
            .interact()?
            .trim()
            .to_string())
    }
}

/// Answers prompts from a fixed list, in order
#[cfg(test)]
pub struct Scripted {
    answers: std::collections::VecDeque<String>,
}

#[cfg(test)]
impl Scripted {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.answers.is_empty()
    }

    fn next(&mut self, prompt: &str) -> Result<String> {
        self.answers
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted answer for '{}'", prompt))
    }
}

#[cfg(test)]
impl SecretSource for Scripted {
    fn text(&mut self, prompt: &str, _default: Option<&str>) -> Result<String> {
        self.next(prompt)
    }

    fn password(&mut self, prompt: &str) -> Result<String> {
        self.next(prompt)
    }
}
