//! Backend-side restart actions.
//!
//! When a backend is taken out of rotation and recovery is enabled, the
//! supervisor launches one of these against the broken host: restart the IIS
//! website or kill-and-relaunch the named process. Both render an Ansible
//! playbook from an embedded template and hand it to `ansible-playbook`.
//! Actions run on detached tasks; their success is observed only through the
//! logs, never correlated back into the probing state.

use std::path::Path;

use chrono::Utc;
use eyre::WrapErr as _;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::{RecoverAction, RestartKind};

/// Rendered playbooks are dropped here, next to the working directory.
const TASKS_DIR: &str = "tasks_yaml";

/// One restart of one backend, ready to run.
pub(crate) struct RestartAction {
    kind: RestartKind,
    /// IIS website name or process name, from the site's recover block.
    target: String,
    site: String,
    host: String,
}

impl RestartAction {
    pub(crate) fn new(recover: &RecoverAction, site: &str, host: &str) -> Self {
        Self {
            kind: recover.kind,
            target: recover.name.clone(),
            site: site.to_string(),
            host: host.to_string(),
        }
    }

    /// Runs the action to completion, logging instead of returning errors;
    /// there is nobody upstream to handle them.
    pub(crate) async fn run(self) {
        info!(site = %self.site, host = %self.host, kind = %self.kind, "launching restart action");
        if let Err(err) = self.execute().await {
            error!(site = %self.site, host = %self.host, error = %err, "restart action failed");
        }
    }

    async fn execute(&self) -> eyre::Result<()> {
        tokio::fs::create_dir_all(TASKS_DIR)
            .await
            .wrap_err_with(|| format!("Failed to create {TASKS_DIR} directory"))?;
        let task_file = Path::new(TASKS_DIR).join(self.task_file_name());
        tokio::fs::write(&task_file, self.playbook())
            .await
            .wrap_err_with(|| format!("Failed to write playbook {}", task_file.display()))?;

        let output = Command::new("ansible-playbook")
            .arg(&task_file)
            .output()
            .await
            .wrap_err("Failed to run ansible-playbook")?;
        debug!(
            playbook = %task_file.display(),
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "restart action output"
        );
        if !output.status.success() {
            eyre::bail!("ansible-playbook exited with {}", output.status);
        }
        Ok(())
    }

    fn task_file_name(&self) -> String {
        format!(
            "{}_{}_{}.yml",
            self.site,
            self.host.replace(':', "_"),
            Utc::now().timestamp()
        )
    }

    /// The Ansible inventory wants the bare host; the engine tracks
    /// backends as `host:port`.
    fn ansible_target(&self) -> &str {
        self.host.split(':').next().unwrap_or(&self.host)
    }

    fn playbook(&self) -> String {
        let host = self.ansible_target();
        let name = &self.target;
        match self.kind {
            RestartKind::RestartIis => format!(
                r"- hosts:
  - {host}
  gather_facts: False
  tasks:
  - name: Restart IIS Website {name}
    win_iis_website: name={name} state=restarted
"
            ),
            RestartKind::RestartProcess => format!(
                r"- hosts:
  - {host}
  gather_facts: False
  tasks:
  - name: Restart Process {name}
    win_shell: |
      $fileInfo=Get-Process -Name {name} -FileVersionInfo
      Stop-Process -Name {name}
      Start-Sleep -s 5
      try {{
          $_ = Get-Process -Name {name}
      }} catch [System.SystemException] {{
          Start-Process -FilePath $fileInfo.FileName
      }}
"
            ),
        }
    }
}
