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

//! CI command wrapper for the repository engines.
//!
//! Runs from the top level of a repository checkout. Exit codes follow the
//! workflow contract: `status` exits 0 iff the event is publishable;
//! `snapshot` and `bump-online` exit 0 iff new versions were produced.

use std::path::PathBuf;
use std::process::{Command as Process, ExitCode};

use clap::{Parser, Subcommand};

use tuf_playground::clock::{CancellationToken, SystemClock};
use tuf_playground::commands;
use tuf_playground::errors::{PlaygroundError, Result};
use tuf_playground::git::GitSurface;
use tuf_playground::signer::SignerRegistry;

#[derive(Parser)]
#[command(name = "playground-repo", about = "CI engines for a git-hosted TUF repository")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render the signing-event verdict of this checkout against the
    /// known-good checkout.
    Status { known_good_dir: PathBuf },
    /// Update snapshot/timestamp from the current repository content.
    Snapshot {
        #[arg(long)]
        push: bool,
        publish_dir: Option<PathBuf>,
    },
    /// Version-bump online roles that are about to expire.
    BumpOnline {
        #[arg(long)]
        push: bool,
        publish_dir: Option<PathBuf>,
    },
    /// Open signing-event branches for offline roles about to expire.
    BumpOffline {
        #[arg(long)]
        push: bool,
    },
    /// Emit the publishable metadata tree.
    Publish { publish_dir: PathBuf },
}

/// Git transport adapter: shells out, with the bot identity the workflow
/// commits under.
struct ProcessGit {
    remote: String,
}

impl ProcessGit {
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Process::new("git")
            .args([
                "-c",
                "user.name=playground-repo",
                "-c",
                "user.email=playground-repo@users.noreply.github.com",
            ])
            .args(args)
            .output()
            .map_err(|e| PlaygroundError::GitSurface(e.to_string()))?;
        if !output.status.success() {
            return Err(PlaygroundError::GitSurface(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl GitSurface for ProcessGit {
    fn read_file(&self, gitref: &str, path: &str) -> Result<Option<Vec<u8>>> {
        match self.run(&["show", &format!("{gitref}:{path}")]) {
            Ok(content) => Ok(Some(content.into_bytes())),
            Err(_) => Ok(None),
        }
    }

    fn commit(&mut self, files: &[(String, Vec<u8>)], message: &str) -> Result<()> {
        // engines write the working tree before committing
        let mut args = vec!["add", "--"];
        let paths: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
        args.extend(paths);
        self.run(&args)?;
        self.run(&["commit", "-m", message])?;
        Ok(())
    }

    fn push(&mut self, branch: &str) -> Result<()> {
        self.run(&["push", &self.remote, &format!("HEAD:{branch}")])?;
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self
            .run(&[
                "show-ref",
                "--quiet",
                "--verify",
                &format!("refs/remotes/{}/{branch}", self.remote),
            ])
            .is_ok())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(command: Command) -> Result<ExitCode> {
    let clock = SystemClock;
    let cancel = CancellationToken::new();
    let registry = SignerRegistry::new();
    let repo_root = PathBuf::from(".");
    let mut git = ProcessGit {
        remote: "origin".to_string(),
    };

    Ok(match command {
        Command::Status { known_good_dir } => {
            let report = commands::status(&repo_root, &known_good_dir, &clock)?;
            println!("{}", report.render());
            if report.verdict.is_publishable() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Snapshot { push, publish_dir } => {
            let changed = commands::snapshot(
                &repo_root,
                &registry,
                &clock,
                cancel,
                publish_dir.as_deref(),
            )?;
            if changed && push {
                git.commit(
                    &[
                        ("metadata/snapshot.json".to_string(), Vec::new()),
                        ("metadata/timestamp.json".to_string(), Vec::new()),
                    ],
                    "Snapshot & timestamp update",
                )?;
                git.push("main")?;
            }
            exit_on_change(changed)
        }
        Command::BumpOnline { push, publish_dir } => {
            let changed = commands::bump_online(
                &repo_root,
                &registry,
                &mut git,
                push,
                &clock,
                cancel,
                publish_dir.as_deref(),
            )?;
            exit_on_change(changed)
        }
        Command::BumpOffline { push } => {
            let events = commands::bump_offline(
                &repo_root, &registry, &mut git, push, &clock, cancel,
            )?;
            for event in events {
                println!("{event}");
            }
            ExitCode::SUCCESS
        }
        Command::Publish { publish_dir } => {
            commands::publish(&repo_root, &registry, &clock, cancel, &publish_dir)?;
            ExitCode::SUCCESS
        }
    })
}

fn exit_on_change(changed: bool) -> ExitCode {
    if changed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
