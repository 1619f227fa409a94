use clap::Args;
use sidechannel::demo;

use super::CliContext;

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Print the report as json
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: DemoArgs, context: &CliContext) -> anyhow::Result<()> {
    let report = demo::run(&context.settings).await?;
    if args.json {
        let value = serde_json::json!({
            "granted": report.granted,
            "deliveries": report.deliveries.iter().map(|(id, d)| (id.clone(), format!("{d:?}"))).collect::<Vec<_>>(),
            "answers": report.answers,
            "events": report.events,
            "effects": report.effects,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Granted: {}", report.granted.join(", "));
    println!("Instructions:");
    for (id, delivery) in &report.deliveries {
        println!("  {id:<16} {delivery:?}");
    }
    println!("Queries:");
    for (id, answer) in &report.answers {
        println!("  {id:<16} {answer}");
    }
    println!("Client effects:");
    for effect in &report.effects {
        println!("  {effect:?}");
    }
    println!("Events seen by the server: {}", report.events.len());
    for event in &report.events {
        println!("  {} {:?}", event.name(), event.params());
    }
    Ok(())
}
