use {
    cirrus_core::{
        compute::{ExecResponse, RunScriptOptions, Script},
        Credentials,
    },
    std::{
        io,
        process::{Output, Stdio},
    },
    tokio::{io::AsyncWriteExt as _, process::Command},
};

pub(super) struct Target<'a> {
    pub address: &'a str,
    pub port: u16,
    pub credentials: &'a Credentials,
}

/// Runs the [`Script`] on the target host by piping it into a remote shell.
pub(super) async fn exec(
    target: &Target<'_>,
    script: &Script,
    options: &RunScriptOptions,
) -> io::Result<ExecResponse> {
    // `ssh` only accepts private keys from files.
    let key_file = tempfile::NamedTempFile::new()?;
    tokio::fs::write(key_file.path(), target.credentials.private_key.as_bytes()).await?;

    let mut command = Command::new("ssh");
    let _ = command
        .arg("-i")
        .arg(key_file.path())
        .arg("-p")
        .arg(target.port.to_string())
        .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"])
        .arg(format!("{}@{}", target.credentials.user, target.address))
        .arg(remote_command(options));

    let output = run(command, script.render().as_bytes()).await?;

    Ok(ExecResponse {
        exit_status: output.status.code().unwrap_or(-1),
        output: String::from_utf8_lossy(&output.stdout).into_owned(),
        error: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs the command, feeding `input` into its stdin while collecting its
/// output.
///
/// Stdin is closed once `input` is written. The command may exit before
/// reading all of it.
async fn run(mut command: Command, input: &[u8]) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take();
    let write = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input).await?;
        }
        io::Result::Ok(())
    };

    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output = output?;

    match written {
        Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
        _ => Ok(output),
    }
}

fn remote_command(options: &RunScriptOptions) -> String {
    let shell = if options.run_as_root {
        "sudo bash"
    } else {
        "bash"
    };

    if !options.wrap_in_init_script {
        return format!("{shell} -s");
    }

    // Store the script on the host and run it in the background, logging into
    // `/tmp/<task>.log`.
    let task = options.task_name.as_deref().unwrap_or("cirrus");
    format!("cat > /tmp/{task}.sh && nohup {shell} /tmp/{task}.sh > /tmp/{task}.log 2>&1 &")
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn output_larger_than_pipe_buffer() {
        let input = "cirrus\n".repeat(1 << 18);
        let output = run(Command::new("cat"), input.as_bytes()).await.unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout.len(), input.len());
    }

    #[tokio::test]
    async fn command_ignoring_stdin() {
        let input = "x".repeat(1 << 20);
        let output = run(Command::new("true"), input.as_bytes()).await.unwrap();

        assert!(output.status.success());
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn remote_commands() {
        assert_eq!(remote_command(&RunScriptOptions::default()), "bash -s");
        assert_eq!(
            remote_command(&RunScriptOptions::default().run_as_root(true)),
            "sudo bash -s"
        );
        assert_eq!(
            remote_command(
                &RunScriptOptions::default()
                    .wrap_in_init_script(true)
                    .task_name("bootstrap")
            ),
            "cat > /tmp/bootstrap.sh && nohup bash /tmp/bootstrap.sh > /tmp/bootstrap.log 2>&1 &"
        );
    }
}
