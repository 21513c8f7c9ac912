//! Rendering of Slurm batch scripts.
//!
//! The script has three parts: `#SBATCH` directives, a batch section that
//! runs once on the first allocated node (environment exports and setup
//! commands), and a single `srun` launch that runs the payload in every
//! process, optionally inside a pyxis container.

use std::fmt::Write as _;

use anyhow::Result;

use crate::env::EnvValue;
use crate::plan::MASTER_ADDR;
use crate::plan::MASTER_PORT;
use crate::plan::NODE_RANK;
use crate::plan::RANK;
use crate::request::Bootstrap;
use crate::request::ContainerInvocation;
use crate::request::HOME_MOUNT;
use crate::request::SubmissionRequest;

/// Renders the batch script for a request.
pub fn render(request: &SubmissionRequest) -> Result<String> {
    let mut script = String::new();
    writeln!(&mut script, "#!/usr/bin/env bash")?;
    render_directives(&mut script, request)?;

    writeln!(&mut script)?;
    for (k, v) in request.environment() {
        match v {
            EnvValue::Literal(v) => writeln!(&mut script, "export {k}={}", quote(v)?)?,
            EnvValue::JobExpr(expr) => writeln!(&mut script, "export {k}=\"{expr}\"")?,
            EnvValue::TaskExpr(_) => {}
        }
    }

    if !request.setup().is_empty() {
        writeln!(&mut script)?;
        for line in request.setup() {
            writeln!(&mut script, "{line}")?;
        }
    }

    writeln!(&mut script)?;
    let directives = request.directives();
    writeln!(
        &mut script,
        "srun --nodes={nodes} --ntasks-per-node={tasks} --distribution=block \\",
        nodes = directives.nodes,
        tasks = directives.tasks_per_node
    )?;
    if let Some(container) = request.container() {
        render_container(&mut script, container)?;
    }
    writeln!(&mut script, "  bash -c {}", quote(&task_body(request)?)?)?;

    Ok(script)
}

/// Renders the `#SBATCH` directives.
fn render_directives(script: &mut String, request: &SubmissionRequest) -> Result<()> {
    let d = request.directives();
    writeln!(script, "#SBATCH --job-name={}", quote(&d.job_name)?)?;
    writeln!(script, "#SBATCH --partition={}", quote(&d.partition)?)?;
    writeln!(script, "#SBATCH --nodes={}", d.nodes)?;
    writeln!(script, "#SBATCH --ntasks-per-node={}", d.tasks_per_node)?;
    writeln!(script, "#SBATCH --cpus-per-task={}", d.cpus_per_task)?;
    if d.gpus_per_node > 0 {
        writeln!(script, "#SBATCH --gpus-per-node={}", d.gpus_per_node)?;
    }
    writeln!(script, "#SBATCH --time={}", d.time_minutes)?;
    if let Some(account) = &d.account {
        writeln!(script, "#SBATCH --account={}", quote(account)?)?;
    }
    if let Some(qos) = &d.qos {
        writeln!(script, "#SBATCH --qos={}", quote(qos)?)?;
    }
    if let Some(constraint) = &d.constraint {
        writeln!(script, "#SBATCH --constraint={}", quote(constraint)?)?;
    }
    writeln!(
        script,
        "#SBATCH --output={}",
        quote(&request.stdout_path().display().to_string())?
    )?;
    writeln!(
        script,
        "#SBATCH --error={}",
        quote(&request.stderr_path().display().to_string())?
    )?;
    writeln!(
        script,
        "#SBATCH --chdir={}",
        quote(&request.working_dir().display().to_string())?
    )?;
    for arg in &d.extra_args {
        writeln!(script, "#SBATCH {arg}")?;
    }
    Ok(())
}

/// Renders the pyxis flags of the `srun` launch.
fn render_container(script: &mut String, container: &ContainerInvocation) -> Result<()> {
    writeln!(script, "  --container-name={} \\", quote(&container.name)?)?;
    if !container.mounts.is_empty() {
        let mounts = container
            .mounts
            .iter()
            .map(|m| {
                if m == HOME_MOUNT {
                    // Left to the shell so `$HOME` is the one of the compute node.
                    Ok(format!("\"{HOME_MOUNT}\""))
                } else {
                    quote(m)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        writeln!(script, "  --container-mounts={} \\", mounts.join(","))?;
    }
    writeln!(script, "  --container-workdir={} \\", quote(&container.workdir)?)?;
    if container.writable {
        writeln!(script, "  --container-writable \\")?;
    }
    // The home directory is mounted explicitly, in order, when requested.
    writeln!(script, "  --no-container-mount-home \\")?;
    Ok(())
}

/// Builds the body run by every launched process.
fn task_body(request: &SubmissionRequest) -> Result<String> {
    let mut body = String::new();
    for (k, v) in request.environment() {
        if let EnvValue::TaskExpr(expr) = v {
            writeln!(&mut body, "export {k}=\"{expr}\"")?;
        }
    }
    render_bootstrap(&mut body, request.bootstrap())?;
    write!(&mut body, "exec {}", shlex::try_join(request.command().iter().map(String::as_str))?)?;
    Ok(body)
}

/// Renders the bootstrap steps of a distributed payload.
fn render_bootstrap(body: &mut String, bootstrap: &Bootstrap) -> Result<()> {
    if bootstrap.hf_login {
        writeln!(body, "if [ \"${RANK}\" = 0 ]; then")?;
        writeln!(body, "  token=\"${{HUGGING_FACE_HUB_TOKEN:-}}\"")?;
        if let Some(file) = &bootstrap.hf_token_file {
            let file = quote(&file.display().to_string())?;
            writeln!(
                body,
                "  if [ -z \"$token\" ] && [ -f {file} ]; then token=\"$(tr -d \"[:space:]\" < \
                 {file})\"; fi"
            )?;
        }
        writeln!(
            body,
            "  if [ -n \"$token\" ]; then huggingface-cli login --token \"$token\"; fi"
        )?;
        writeln!(body, "fi")?;
    }
    if bootstrap.wait_for_master {
        writeln!(body, "if [ \"${NODE_RANK}\" != 0 ]; then")?;
        writeln!(
            body,
            "  until (exec 3<>\"/dev/tcp/${MASTER_ADDR}/${MASTER_PORT}\") 2>/dev/null; do sleep \
             1; done"
        )?;
        writeln!(body, "fi")?;
    }
    Ok(())
}

/// Quotes a value for the shell.
fn quote(value: &str) -> Result<String> {
    Ok(shlex::try_quote(value)?.into_owned())
}
