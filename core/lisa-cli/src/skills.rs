//! `lisa skills <cmd>`: keep the repo's skill copy and the agents' installed
//! copies in step.

use clap::Subcommand;
use lisa_core::skills::{
    skills_doctor_command, skills_install_command, skills_sync_command, SkillsDoctorRequest, SkillsInstallRequest,
    SkillsSyncRequest,
};
use lisa_protocol::CommandOutput;

#[derive(Subcommand, Debug, Clone)]
pub enum SkillsCommand {
    /// Copy an installed skill back into the repo
    Sync {
        /// codex (default), claude, or a directory
        #[arg(long)]
        from: Option<String>,

        /// Repository root (defaults to the cwd)
        #[arg(long)]
        repo_root: Option<String>,
    },

    /// Install the repo's skill for one or more agents
    Install {
        /// codex, claude, all, or a directory (default: every agent home that exists)
        #[arg(long)]
        to: Option<String>,

        /// Repository root (defaults to the cwd)
        #[arg(long)]
        repo_root: Option<String>,
    },

    /// Compare installed copies against the repo
    Doctor {
        /// Repository root (defaults to the cwd)
        #[arg(long)]
        repo_root: Option<String>,

        /// Extra installed copy to inspect
        #[arg(long)]
        path: Option<String>,

        /// Compare content hashes, not only versions
        #[arg(long)]
        deep: bool,

        /// List the files that differ
        #[arg(long)]
        explain_drift: bool,

        /// Also check the repo doc against the command contracts
        #[arg(long)]
        contract_check: bool,
    },
}

impl SkillsCommand {
    pub fn execute(self) -> CommandOutput {
        match self {
            SkillsCommand::Sync { from, repo_root } => skills_sync_command(&SkillsSyncRequest {
                from: from.unwrap_or_default(),
                repo_root: repo_root.unwrap_or_default(),
                home: None,
            }),
            SkillsCommand::Install { to, repo_root } => skills_install_command(&SkillsInstallRequest {
                to: to.unwrap_or_default(),
                repo_root: repo_root.unwrap_or_default(),
                home: None,
            }),
            SkillsCommand::Doctor { repo_root, path, deep, explain_drift, contract_check } => {
                skills_doctor_command(&SkillsDoctorRequest {
                    repo_root: repo_root.unwrap_or_default(),
                    path: path.unwrap_or_default(),
                    deep,
                    explain_drift,
                    contract_check,
                    home: None,
                })
            }
        }
    }
}
