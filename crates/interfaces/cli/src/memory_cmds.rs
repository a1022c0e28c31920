use std::io;
use std::io::IsTerminal;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use tokio::sync::watch;

use awareness_memory::{
    AxisVector, CycleOutcome, FeedbackContext, Insight, MemoryManager, MemoryRecord, RecordKind,
    SkipReason, truncate_str,
};

pub(crate) async fn run_ingest(
    memory: &MemoryManager,
    kind: RecordKind,
    at: Option<&str>,
    text: &str,
) -> Result<()> {
    let record = match at {
        Some(raw) => {
            let created_at = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid --at timestamp: {raw}"))?
                .with_timezone(&Utc);
            memory.append_at(kind, text, created_at).await?
        }
        None => memory.append(kind, text).await?,
    };
    print_record(&record);
    let pending = memory.unconsolidated_count(None).await;
    println!("unconsolidated records: {pending}");
    Ok(())
}

pub(crate) async fn run_feedback(
    memory: &MemoryManager,
    user_input: String,
    assistant_output: String,
    feedback: String,
) -> Result<()> {
    let context = FeedbackContext {
        user_input,
        assistant_output,
        feedback,
        response_axes: None,
    };
    let record = memory.append_feedback(&context).await?;
    print_record(&record);
    Ok(())
}

/// Threshold-gated cycle after an append when `dreaming.auto_trigger` is on.
pub(crate) async fn maybe_auto_dream(memory: &MemoryManager, enabled: bool) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let outcome = memory.check_and_run().await?;
    if !matches!(outcome, CycleOutcome::Skipped { .. }) {
        println!("auto-dream: {}", describe_outcome(&outcome));
    }
    Ok(())
}

pub(crate) async fn run_dream(memory: &MemoryManager, force: bool) -> Result<()> {
    let outcome = if force {
        memory.trigger_dreaming_cycle().await?
    } else {
        memory.check_and_run().await?
    };
    println!("{}", describe_outcome(&outcome));
    if let CycleOutcome::Committed { batch_id, .. } = &outcome {
        if let Some(insight) = memory.insights().list_by_batch(batch_id).await {
            println!();
            print!("{}", insight.render_report());
        }
    }
    if let CycleOutcome::Failed { .. } = outcome {
        bail!("dreaming cycle failed; records stay unconsolidated for the next attempt");
    }
    Ok(())
}

pub(crate) async fn run_status(memory: &MemoryManager, json: bool) -> Result<()> {
    let stats = memory.stats().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("── records ───────────────────────────────────");
    println!(
        "total={} turns={} reflections={} feedback={}",
        stats.store.total, stats.store.turns, stats.store.reflections, stats.store.feedback
    );
    println!(
        "consolidated={} unconsolidated={} unscored={}",
        stats.store.consolidated, stats.store.unconsolidated, stats.store.unscored
    );

    println!("── dreaming ──────────────────────────────────");
    println!(
        "threshold: {}/{} ({})",
        stats.threshold.unconsolidated,
        stats.threshold.threshold,
        if stats.threshold.ready { "ready" } else { "waiting" }
    );
    println!(
        "committed cycles: {} ({} records consolidated)",
        stats.dreaming.cycles_committed, stats.dreaming.records_consolidated
    );
    match stats.dreaming.last_dream_at {
        Some(at) => println!("last dream: {}", local(at)),
        None => println!("last dream: never"),
    }
    println!(
        "this process: failed={} coalesced={} skipped={}",
        stats.dreaming.failed_since_start,
        stats.dreaming.coalesced_since_start,
        stats.dreaming.skipped_since_start
    );
    if let (Some(outcome), Some(at)) = (&stats.dreaming.last_outcome, stats.dreaming.last_outcome_at)
    {
        println!("last cycle this process: {} at {}", describe_outcome(outcome), local(at));
    }

    println!("── axis bias ─────────────────────────────────");
    print_bias(&stats.weights.bias);
    println!("insights applied: {}", stats.weights.applied_insights);
    Ok(())
}

pub(crate) async fn run_insights(memory: &MemoryManager, limit: usize, report: bool) -> Result<()> {
    let insights = memory.list_recent_insights(limit).await;
    if insights.is_empty() {
        println!("no insights yet");
        return Ok(());
    }
    for insight in insights {
        if report {
            print!("{}", insight.render_report());
            println!();
        } else {
            print_insight_summary(&insight);
        }
    }
    Ok(())
}

pub(crate) async fn run_recent(memory: &MemoryManager, limit: usize) -> Result<()> {
    let records = memory.store().recent(limit).await;
    if records.is_empty() {
        println!("no records stored");
    }
    for record in records {
        print_record(&record);
    }
    Ok(())
}

pub(crate) async fn run_search(memory: &MemoryManager, query: &str, k: usize) -> Result<()> {
    let hits = memory.search(query, k).await;
    if hits.is_empty() {
        println!("no matches");
        return Ok(());
    }
    for (record, similarity) in hits {
        println!(
            "{similarity:.3}  [{}] {}  {}",
            record.kind.label(),
            record.id_short(),
            truncate_str(&record.text, 100)
        );
    }
    Ok(())
}

pub(crate) async fn run_weights(memory: &MemoryManager, reset: bool, yes: bool) -> Result<()> {
    if !reset {
        let weights = memory.axis_weights();
        print_bias(&weights.bias);
        println!("insights applied: {}", weights.applied_insights);
        if let Some(id) = &weights.last_insight_id {
            println!("last insight: {id}");
        }
        println!("updated: {}", local(weights.updated_at));
        return Ok(());
    }

    if !yes {
        if !io::stdin().is_terminal() {
            bail!("refusing to reset axis weights in non-interactive mode without --yes");
        }
        print!("This clears the learned axis bias. Type 'RESET' to continue: ");
        io::stdout().flush()?;
        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim() != "RESET" {
            bail!("confirmation mismatch; aborted axis weight reset");
        }
    }

    let weights = memory.reset_axis_weights().await?;
    println!("axis bias reset");
    print_bias(&weights.bias);
    Ok(())
}

pub(crate) async fn run_watch(
    memory: &MemoryManager,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let handle = memory.spawn_auto_dreaming(interval, &shutdown_tx);
    let mut phases = memory.dreaming().subscribe();
    println!(
        "watching; threshold check every {}s (Ctrl-C to stop)",
        interval.as_secs()
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                println!("{}  phase: {phase:?}", Local::now().format("%H:%M:%S"));
            }
            signal = &mut shutdown => {
                signal?;
                println!("shutting down");
                break;
            }
        }
    }

    shutdown_tx.send_replace(true);
    handle.await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn describe_outcome(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::Skipped {
            reason: SkipReason::BelowThreshold { count, threshold },
        } => format!("skipped: {count} unconsolidated records, threshold is {threshold}"),
        CycleOutcome::Skipped {
            reason: SkipReason::EmptyBatch,
        } => "skipped: nothing to consolidate".to_string(),
        CycleOutcome::Coalesced => "coalesced into a cycle already in progress".to_string(),
        CycleOutcome::Committed {
            insight_id,
            records,
            accepted,
            ..
        } => format!(
            "committed insight {} from {records} records ({})",
            truncate_str(insight_id, 8),
            if *accepted { "accepted" } else { "rejected, weights unchanged" }
        ),
        CycleOutcome::Failed { kind, message } => format!("failed ({kind:?}): {message}"),
    }
}

fn print_record(record: &MemoryRecord) {
    let axes = if record.scored {
        record.axes.compact()
    } else {
        "unscored".to_string()
    };
    println!(
        "{} [{}] {}  {}",
        local(record.created_at),
        record.kind.label(),
        record.id_short(),
        truncate_str(&record.text, 100)
    );
    println!("    {axes}");
}

fn print_insight_summary(insight: &Insight) {
    println!(
        "{} {}  batch={} records={} {}",
        local(insight.created_at),
        truncate_str(&insight.id, 8),
        insight.batch_id,
        insight.record_count,
        if insight.accepted { "accepted" } else { "rejected" }
    );
    for (label, statements) in [
        ("corrective", &insight.sections.corrective),
        ("reinforcing", &insight.sections.reinforcing),
        ("emergent", &insight.sections.emergent),
    ] {
        for statement in statements {
            println!("    {label}: {}", statement.text);
        }
    }
}

fn print_bias(bias: &AxisVector) {
    for (axis, value) in bias.iter() {
        println!("  {:<34} {value:+.3}", axis.label());
    }
}

fn local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
