//! Interactive confirmation and choice prompts.
//!
//! Operations never probe the terminal themselves; they ask a `Confirmer`,
//! so tests and non-interactive callers substitute their own answers.

use std::io::{self, BufRead, IsTerminal, Write};

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("failed to write prompt: {source}")]
    Write {
        #[source]
        source: io::Error,
    },
    #[error("failed to read answer: {source}")]
    Read {
        #[source]
        source: io::Error,
    },
    #[error("input closed before an answer was given")]
    Eof,
    #[error("no options to choose from")]
    NoOptions,
}

pub trait Confirmer {
    /// Whether a human can answer prompts.
    fn is_interactive(&self) -> bool;
    fn confirm(&self, prompt: &str) -> Result<bool, ConfirmError>;
    /// Returns the index of the chosen option.
    fn select(&self, prompt: &str, options: &[String]) -> Result<usize, ConfirmError>;
}

/// Prompts on stdout and reads answers from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConfirmer;

impl TerminalConfirmer {
    fn read_answer(prompt: &str) -> Result<String, ConfirmError> {
        print!("{prompt}");
        io::stdout()
            .flush()
            .map_err(|source| ConfirmError::Write { source })?;

        let mut line = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|source| ConfirmError::Read { source })?;
        if read == 0 {
            return Err(ConfirmError::Eof);
        }
        Ok(line.trim().to_string())
    }
}

impl Confirmer for TerminalConfirmer {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal() && io::stdout().is_terminal()
    }

    fn confirm(&self, prompt: &str) -> Result<bool, ConfirmError> {
        let answer = Self::read_answer(&format!("{prompt} [y/N]: "))?;
        Ok(parse_yes(&answer))
    }

    fn select(&self, prompt: &str, options: &[String]) -> Result<usize, ConfirmError> {
        if options.is_empty() {
            return Err(ConfirmError::NoOptions);
        }
        println!("{prompt}");
        for (idx, option) in options.iter().enumerate() {
            println!("  {}) {option}", idx + 1);
        }
        loop {
            let answer = Self::read_answer(&format!("choice [1-{}]: ", options.len()))?;
            match parse_choice(&answer, options.len()) {
                Some(idx) => return Ok(idx),
                None => println!("invalid choice: expected a number from 1 to {}", options.len()),
            }
        }
    }
}

pub fn parse_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Parse a 1-based menu choice into a 0-based index.
pub fn parse_choice(answer: &str, len: usize) -> Option<usize> {
    answer
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=len).contains(n))
        .map(|n| n - 1)
}

/// Replays canned answers. Confirmations are consumed first-in first-out,
/// as are selections; running out of answers is an `Eof`.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedConfirmer {
    pub interactive: bool,
    confirms: std::cell::RefCell<std::collections::VecDeque<bool>>,
    selections: std::cell::RefCell<std::collections::VecDeque<usize>>,
    pub prompts: std::cell::RefCell<Vec<String>>,
}

#[cfg(test)]
impl ScriptedConfirmer {
    pub fn non_interactive() -> Self {
        Self::default()
    }

    pub fn interactive() -> Self {
        Self {
            interactive: true,
            ..Self::default()
        }
    }

    pub fn with_confirms(self, answers: &[bool]) -> Self {
        self.confirms.borrow_mut().extend(answers.iter().copied());
        self
    }

    pub fn with_selections(self, answers: &[usize]) -> Self {
        self.selections.borrow_mut().extend(answers.iter().copied());
        self
    }
}

#[cfg(test)]
impl Confirmer for ScriptedConfirmer {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn confirm(&self, prompt: &str) -> Result<bool, ConfirmError> {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.confirms.borrow_mut().pop_front().ok_or(ConfirmError::Eof)
    }

    fn select(&self, prompt: &str, options: &[String]) -> Result<usize, ConfirmError> {
        if options.is_empty() {
            return Err(ConfirmError::NoOptions);
        }
        self.prompts.borrow_mut().push(prompt.to_string());
        self.selections
            .borrow_mut()
            .pop_front()
            .ok_or(ConfirmError::Eof)
    }
}
