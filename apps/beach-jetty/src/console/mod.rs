//! Line-oriented operator console: list clients, open a shell on one, and
//! keep a set of command templates.

mod templates;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::{debug, warn};

use crate::control_plane::{display_value, paths, SharedControlPlane, Subscription};
use crate::reaper::{list_clients, ClientRecord, Reaper};

pub use templates::{fill, placeholders, CommandTemplate, TemplateStore};

pub const DEFAULT_OUTPUT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShellExit {
    Back,
    Quit,
}

pub struct Console<R, W> {
    control: SharedControlPlane,
    reaper: Reaper,
    templates: TemplateStore,
    output_timeout: Duration,
    input: Lines<R>,
    out: W,
}

/// Runs the console on the process's stdin and stdout.
pub async fn run_stdio(
    control: SharedControlPlane,
    reaper: Reaper,
    templates: &Path,
    output_timeout: Duration,
) -> Result<()> {
    let templates = TemplateStore::load(templates)?;
    let input = BufReader::new(tokio::io::stdin());
    let mut console = Console::new(
        control,
        reaper,
        templates,
        output_timeout,
        input,
        tokio::io::stdout(),
    );
    console.run().await
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        control: SharedControlPlane,
        reaper: Reaper,
        templates: TemplateStore,
        output_timeout: Duration,
        input: R,
        out: W,
    ) -> Self {
        Self {
            control,
            reaper,
            templates,
            output_timeout,
            input: input.lines(),
            out,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Main menu loop. Returns on `q`, `exit` from a shell, or end of input.
    pub async fn run(&mut self) -> Result<()> {
        self.say("Remote command console").await?;
        self.refresh().await?;

        loop {
            let clients = list_clients(&self.control).await;
            self.show_clients(&clients).await?;
            self.say("").await?;
            self.say("Options: <number> select client, r refresh, t templates, q quit")
                .await?;

            let Some(choice) = self.prompt("> ").await? else {
                return Ok(());
            };
            match choice.to_ascii_lowercase().as_str() {
                "" => continue,
                "q" => {
                    self.say("Goodbye!").await?;
                    return Ok(());
                }
                "r" => self.refresh().await?,
                "t" => self.manage_templates().await?,
                other => match other.parse::<usize>() {
                    Ok(index) if (1..=clients.len()).contains(&index) => {
                        let client = clients[index - 1].clone();
                        if self.shell(&client).await? == ShellExit::Quit {
                            return Ok(());
                        }
                    }
                    Ok(_) => self.say("Invalid client number").await?,
                    Err(_) => self.say("Invalid input").await?,
                },
            }
        }
    }

    async fn refresh(&mut self) -> Result<()> {
        self.say("Checking for inactive clients...").await?;
        let report = self.reaper.run_pass().await;
        if report.probed.is_empty() {
            return self.say("No clients to check").await;
        }
        for removed in &report.removed {
            self.say(&format!(
                "Removed inactive client: {} ({})",
                removed.label, removed.id
            ))
            .await?;
        }
        if report.removed.is_empty() {
            self.say("All clients are active").await
        } else {
            self.say(&format!("Removed {} inactive client(s)", report.removed.len()))
                .await
        }
    }

    async fn show_clients(&mut self, clients: &[ClientRecord]) -> Result<()> {
        if clients.is_empty() {
            return self.say("No clients found").await;
        }
        self.say(&format!(
            "{:<5} {:<20} {:<16} {:<12} {:<19} {}",
            "#", "Label", "Identity", "Status", "Last seen", "Address"
        ))
        .await?;
        for (index, client) in clients.iter().enumerate() {
            let last_seen: String = client.last_seen.chars().take(19).collect();
            self.say(&format!(
                "{:<5} {:<20} {:<16} {:<12} {:<19} {}",
                index + 1,
                client.label,
                client.id,
                client.status,
                last_seen,
                client.address
            ))
            .await?;
        }
        Ok(())
    }

    async fn shell(&mut self, client: &ClientRecord) -> Result<ShellExit> {
        self.say(&format!("Connected to: {} ({})", client.label, client.id))
            .await?;
        self.say("Type commands and press Enter. 'template' runs a saved command, 'back' returns, 'exit' quits.")
            .await?;

        let mut outputs = match self.control.subscribe(&paths::output(&client.id)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(identity = %client.id, error = %err, "failed to watch client output");
                self.say(&format!("Cannot watch output: {}", err)).await?;
                return Ok(ShellExit::Back);
            }
        };
        // Current value, not a response.
        let _ = outputs.next().await;

        let prompt = format!("{} $ ", client.label);
        loop {
            let Some(line) = self.prompt(&prompt).await? else {
                return Ok(ShellExit::Quit);
            };
            match line.to_ascii_lowercase().as_str() {
                "" => continue,
                "exit" => return Ok(ShellExit::Quit),
                "back" => return Ok(ShellExit::Back),
                "template" => self.use_template(&client.id, &mut outputs).await?,
                _ => self.send_and_wait(&client.id, &line, &mut outputs).await?,
            }
        }
    }

    async fn send_and_wait(
        &mut self,
        identity: &str,
        command: &str,
        outputs: &mut Subscription,
    ) -> Result<()> {
        while outputs.try_next().is_some() {}

        if let Err(err) = self
            .control
            .set(&paths::command(identity), json!(command))
            .await
        {
            warn!(%identity, error = %err, "failed to send command");
            return self.say(&format!("Error sending command: {}", err)).await;
        }
        debug!(%identity, %command, "command sent");
        self.say("Waiting for response...").await?;

        match tokio::time::timeout(self.output_timeout, outputs.next()).await {
            Ok(Some(event)) => self.say(&display_value(&event.data)).await,
            Ok(None) => self.say("Output watch closed").await,
            Err(_) => {
                self.say(&format!("No response within {:?}", self.output_timeout))
                    .await
            }
        }
    }

    async fn use_template(&mut self, identity: &str, outputs: &mut Subscription) -> Result<()> {
        if self.templates.is_empty() {
            return self.say("No command templates available").await;
        }
        self.list_templates().await?;
        let Some(template) = self.choose_template("Select template (0 to cancel): ").await? else {
            return Ok(());
        };

        let mut values = Vec::new();
        for name in template.placeholders() {
            let Some(value) = self.prompt(&format!("Enter {}: ", name)).await? else {
                return Ok(());
            };
            values.push((name, value));
        }
        let command = fill(&template.command, &values);
        self.say(&format!("Final command: {}", command)).await?;

        let confirmed = self
            .prompt("Execute this command? [y/n]: ")
            .await?
            .map(|answer| matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
            .unwrap_or(false);
        if confirmed {
            self.send_and_wait(identity, &command, outputs).await?;
        }
        Ok(())
    }

    async fn manage_templates(&mut self) -> Result<()> {
        loop {
            self.say("Templates: 1 list, 2 add, 3 delete, 4 back").await?;
            let Some(choice) = self.prompt("> ").await? else {
                return Ok(());
            };
            match choice.as_str() {
                "1" => self.list_templates().await?,
                "2" => self.add_template().await?,
                "3" => self.delete_template().await?,
                "4" | "" => return Ok(()),
                _ => self.say("Invalid input").await?,
            }
        }
    }

    async fn list_templates(&mut self) -> Result<()> {
        if self.templates.is_empty() {
            return self.say("No templates available").await;
        }
        let lines: Vec<String> = self
            .templates
            .list()
            .iter()
            .enumerate()
            .map(|(index, template)| {
                format!("  {}. {}: {}", index + 1, template.title, template.command)
            })
            .collect();
        for line in lines {
            self.say(&line).await?;
        }
        Ok(())
    }

    async fn add_template(&mut self) -> Result<()> {
        self.say("Use <name> for arguments, e.g. screenshot <display>")
            .await?;
        let Some(title) = self.prompt("Template title: ").await? else {
            return Ok(());
        };
        let Some(command) = self.prompt("Command: ").await? else {
            return Ok(());
        };
        match self.templates.add(&title, &command) {
            Ok(()) => {
                let saved = format!("Template added to {}", self.templates.path().display());
                self.say(&saved).await
            }
            Err(err) => self.say(&format!("Template not added: {:#}", err)).await,
        }
    }

    async fn delete_template(&mut self) -> Result<()> {
        if self.templates.is_empty() {
            return self.say("No templates to delete").await;
        }
        self.list_templates().await?;
        let Some(choice) = self.prompt("Template number to delete (0 to cancel): ").await? else {
            return Ok(());
        };
        let Ok(index) = choice.parse::<usize>() else {
            return self.say("Invalid input").await;
        };
        if index == 0 {
            return Ok(());
        }
        match self.templates.remove(index) {
            Ok(Some(removed)) => {
                self.say(&format!("Template '{}' deleted", removed.title))
                    .await
            }
            Ok(None) => self.say("Invalid selection").await,
            Err(err) => self.say(&format!("Template not deleted: {:#}", err)).await,
        }
    }

    async fn choose_template(&mut self, prompt: &str) -> Result<Option<CommandTemplate>> {
        let Some(choice) = self.prompt(prompt).await? else {
            return Ok(None);
        };
        match choice.parse::<usize>() {
            Ok(0) => Ok(None),
            Ok(index) => match self.templates.get(index) {
                Some(template) => Ok(Some(template.clone())),
                None => {
                    self.say("Invalid selection").await?;
                    Ok(None)
                }
            },
            Err(_) => {
                self.say("Invalid input").await?;
                Ok(None)
            }
        }
    }

    /// Trimmed next input line; `None` at end of input.
    async fn prompt(&mut self, prompt: &str) -> Result<Option<String>> {
        self.out.write_all(prompt.as_bytes()).await?;
        self.out.flush().await?;
        Ok(self
            .input
            .next_line()
            .await?
            .map(|line| line.trim().to_string()))
    }

    async fn say(&mut self, line: &str) -> Result<()> {
        self.out.write_all(line.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::control_plane::MemoryControlPlane;

    fn console(
        control: SharedControlPlane,
        templates: TemplateStore,
        script: &'static str,
    ) -> Console<&'static [u8], Vec<u8>> {
        let reaper = Reaper::standalone(Arc::clone(&control), Duration::from_millis(20));
        Console::new(
            control,
            reaper,
            templates,
            Duration::from_millis(500),
            script.as_bytes(),
            Vec::new(),
        )
    }

    /// Answers every command on `identity` with `out:<command>`.
    fn spawn_responder(control: SharedControlPlane, identity: &'static str) {
        tokio::spawn(async move {
            let mut commands = control.subscribe(&paths::command(identity)).await.unwrap();
            while let Some(event) = commands.next().await {
                if let serde_json::Value::String(command) = event.data {
                    control
                        .set(&paths::output(identity), json!(format!("out:{}", command)))
                        .await
                        .unwrap();
                }
            }
        });
    }

    #[test_timeout::tokio_timeout_test]
    async fn templates_can_be_added_from_the_menu() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command_templates.json");
        let control: SharedControlPlane = MemoryControlPlane::new();
        let templates = TemplateStore::load(&path).unwrap();

        let mut console = console(control, templates, "t\n2\nWho\nwhoami\n1\n4\nq\n");
        console.run().await.unwrap();
        let output = String::from_utf8(console.into_output()).unwrap();

        assert!(output.contains("No clients found"));
        assert!(output.contains("Template added"));
        assert!(output.contains("1. Who: whoami"));
        assert_eq!(TemplateStore::load(&path).unwrap().list().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn shell_prints_client_output() {
        let dir = tempfile::tempdir().unwrap();
        let control: SharedControlPlane = MemoryControlPlane::new();
        control.set("/abc123/pc_name", json!("PC1")).await.unwrap();
        control.set("/abc123/status", json!("connected")).await.unwrap();
        spawn_responder(Arc::clone(&control), "abc123");
        tokio::task::yield_now().await;

        let templates = TemplateStore::load(dir.path().join("t.json")).unwrap();
        let mut console = console(Arc::clone(&control), templates, "1\nhostname\nexit\n");
        console.run().await.unwrap();
        let output = String::from_utf8(console.into_output()).unwrap();

        assert!(output.contains("All clients are active"));
        assert!(output.contains("Connected to: PC1 (abc123)"));
        assert!(output.contains("out:hostname"));
        assert_eq!(
            control.get("/abc123/exe/command").await.unwrap(),
            json!("hostname")
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn silent_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let control: SharedControlPlane = MemoryControlPlane::new();
        control.set("/quiet/pc_name", json!("PC2")).await.unwrap();

        let templates = TemplateStore::load(dir.path().join("t.json")).unwrap();
        let reaper = Reaper::standalone(Arc::clone(&control), Duration::from_millis(20));
        let mut console = Console::new(
            Arc::clone(&control),
            reaper,
            templates,
            Duration::from_millis(50),
            "ls\nback\n".as_bytes(),
            Vec::new(),
        );
        // Shell directly, without the reaping menu pass.
        let client = list_clients(&control).await.remove(0);
        assert_eq!(console.shell(&client).await.unwrap(), ShellExit::Back);
        let output = String::from_utf8(console.into_output()).unwrap();
        assert!(output.contains("No response within 50ms"));
    }
}
