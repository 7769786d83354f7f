//
// Copyright 2023 The Playground Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Abstract input source for the workbench.
//!
//! The interactive menu loop is a state machine over this trait, which makes
//! every workbench flow scriptable in tests without a tty.

use std::collections::VecDeque;

use crate::errors::{PlaygroundError, Result};

pub trait Prompt {
    /// Choose an option in `0..=max`; an empty answer selects `default`.
    fn choose(&mut self, prompt: &str, max: u32, default: u32) -> Result<u32>;

    /// Read one line; an empty answer yields `default`.
    fn line(&mut self, prompt: &str, default: &str) -> Result<String>;

    /// Wait for acknowledgement (e.g. "insert your HW key and press enter").
    fn confirm(&mut self, prompt: &str) -> Result<()>;
}

/// A prompt fed from a fixed list of answers. Running out of answers is
/// treated as the user walking away.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<String>,
}

impl ScriptedPrompt {
    pub fn new<S: Into<String>>(answers: impl IntoIterator<Item = S>) -> Self {
        ScriptedPrompt {
            answers: answers.into_iter().map(Into::into).collect(),
        }
    }

    fn next(&mut self) -> Result<String> {
        self.answers.pop_front().ok_or(PlaygroundError::Cancelled)
    }
}

impl Prompt for ScriptedPrompt {
    fn choose(&mut self, _prompt: &str, max: u32, default: u32) -> Result<u32> {
        let answer = self.next()?;
        if answer.is_empty() {
            return Ok(default);
        }
        let choice: u32 = answer.parse().map_err(|_| {
            PlaygroundError::InvariantViolation(format!("scripted answer {answer:?} is not a number"))
        })?;
        if choice > max {
            return Err(PlaygroundError::InvariantViolation(format!(
                "scripted choice {choice} out of range 0..={max}"
            )));
        }
        Ok(choice)
    }

    fn line(&mut self, _prompt: &str, default: &str) -> Result<String> {
        let answer = self.next()?;
        if answer.is_empty() {
            Ok(default.to_string())
        } else {
            Ok(answer)
        }
    }

    fn confirm(&mut self, _prompt: &str) -> Result<()> {
        self.next().map(|_| ())
    }
}
