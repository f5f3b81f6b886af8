use std::path::Path;

use hoist_core::CommandOutput;

pub async fn run(path: &Path, job: &str, command: &str) -> anyhow::Result<()> {
    let (_, orch) = super::orchestrator(path)?;
    let outputs = orch.run_command(job, command).await?;
    print_outputs(&outputs);
    Ok(())
}

pub async fn script(path: &Path, job: &str, script: &Path) -> anyhow::Result<()> {
    let (_, orch) = super::orchestrator(path)?;
    let outputs = orch.run_script(job, script).await?;
    print_outputs(&outputs);
    Ok(())
}

fn print_outputs(outputs: &[(String, CommandOutput)]) {
    for (host, output) in outputs {
        println!("── {host}");
        print!("{}", output.stdout);
        if !output.stdout.is_empty() && !output.stdout.ends_with('\n') {
            println!();
        }
    }
}
