//! Serial console and instance-state signal waiting.
//!
//! Serial output is polled from the last returned offset and scanned line by
//! line. Transient API errors are retried at the poll interval; the step's
//! timeout bounds the whole wait.

use futures::StreamExt;
use futures::future::try_join_all;
use futures::stream::FuturesUnordered;
use tracing::{debug, info, warn};
use vmport_compute::InstanceStatus;
use vmport_workflow::{InstanceSignal, SerialOutputSignal};

use super::{StepContext, ZonalRef};
use crate::error::StepError;
use crate::events::ExecutionEvent;
use crate::result::parse_serial_tags;

pub(super) async fn wait_for_all(ctx: &StepContext, signals: &[InstanceSignal]) -> Result<(), StepError> {
  try_join_all(signals.iter().map(|s| wait_for_signal(ctx, s))).await?;
  Ok(())
}

/// Succeeds with the first signal that succeeds; any failure fails the step.
pub(super) async fn wait_for_any(ctx: &StepContext, signals: &[InstanceSignal]) -> Result<(), StepError> {
  let mut pending: FuturesUnordered<_> = signals.iter().map(|s| wait_for_signal(ctx, s)).collect();
  match pending.next().await {
    Some(result) => result,
    None => Ok(()),
  }
}

enum LineOutcome {
  Continue,
  Success,
}

struct SerialWatch<'a> {
  signal: &'a SerialOutputSignal,
  offset: i64,
  partial: String,
}

async fn wait_for_signal(ctx: &StepContext, signal: &InstanceSignal) -> Result<(), StepError> {
  let instance = ctx.zonal(&signal.name, "instances");
  let mut watch = signal.serial_output.as_ref().map(|serial| SerialWatch {
    signal: serial,
    offset: 0,
    partial: String::new(),
  });
  info!(step = %ctx.step, instance = %instance.name, "waiting for instance signal");

  loop {
    if let Some(watch) = watch.as_mut() {
      if poll_serial(ctx, &instance, watch).await? {
        info!(step = %ctx.step, instance = %instance.name, "instance signalled success");
        return Ok(());
      }
    }

    if signal.stopped {
      match ctx
        .compute
        .get_instance(&instance.project, &instance.zone, &instance.name)
        .await
      {
        Ok(i) if i.status == InstanceStatus::Terminated => {
          info!(step = %ctx.step, instance = %instance.name, "instance stopped");
          return Ok(());
        }
        Ok(_) => {}
        Err(e) if e.is_transient() => {
          debug!(instance = %instance.name, error = %e, "retrying instance status");
        }
        Err(e) => return Err(StepError::api("get instance", &instance.name, e)),
      }
    }

    tokio::select! {
      _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
      _ = tokio::time::sleep(ctx.poll_interval) => {}
    }
  }
}

/// Returns `true` once the success pattern has been seen.
async fn poll_serial(
  ctx: &StepContext,
  instance: &ZonalRef,
  watch: &mut SerialWatch<'_>,
) -> Result<bool, StepError> {
  let port = watch.signal.port;
  let output = match ctx
    .compute
    .get_serial_port_output(&instance.project, &instance.zone, &instance.name, port, watch.offset)
    .await
  {
    Ok(output) => output,
    Err(e) if e.is_transient() => {
      warn!(instance = %instance.name, port, error = %e, "serial port read failed, retrying");
      return Ok(false);
    }
    Err(e) => return Err(StepError::api("read serial port", &instance.name, e)),
  };
  watch.offset = output.next;
  watch.partial.push_str(&output.contents);

  if let Some(last_newline) = watch.partial.rfind('\n') {
    let complete: String = watch.partial.drain(..=last_newline).collect();
    for line in complete.lines() {
      if let LineOutcome::Success = scan_line(ctx, instance, watch.signal, line)? {
        return Ok(true);
      }
    }
  }

  // The unterminated tail is scanned only once it holds a signal pattern.
  if holds_signal(watch.signal, &watch.partial) {
    let tail = std::mem::take(&mut watch.partial);
    if let LineOutcome::Success = scan_line(ctx, instance, watch.signal, &tail)? {
      return Ok(true);
    }
  }
  Ok(false)
}

fn holds_signal(signal: &SerialOutputSignal, text: &str) -> bool {
  signal.success_match.iter().chain(&signal.failure_match).any(|p| text.contains(p.as_str()))
}

fn scan_line(
  ctx: &StepContext,
  instance: &ZonalRef,
  signal: &SerialOutputSignal,
  line: &str,
) -> Result<LineOutcome, StepError> {
  let tags = parse_serial_tags(line);
  if !tags.is_empty() {
    let mut values = ctx.state.serial_values.lock().unwrap();
    for (key, value) in tags {
      debug!(instance = %instance.name, key = %key, value = %value, "serial output value");
      values.insert(key, value);
    }
  }

  if let Some(pattern) = signal.failure_match.iter().find(|p| line.contains(p.as_str())) {
    return Err(StepError::FailureMatch {
      instance: instance.name.clone(),
      port: signal.port,
      pattern: pattern.clone(),
      line: line.trim().to_string(),
    });
  }

  if let Some(status) = &signal.status_match {
    if line.contains(status.as_str()) {
      let line = line.trim().to_string();
      info!(step = %ctx.step, instance = %instance.name, "{}", line);
      ctx.state.trace_logs.lock().unwrap().push(line.clone());
      ctx.notifier.notify(ExecutionEvent::SerialOutput {
        workflow: ctx.workflow.clone(),
        step: ctx.step.clone(),
        instance: instance.name.clone(),
        line,
      });
    }
  }

  match &signal.success_match {
    Some(pattern) if line.contains(pattern.as_str()) => Ok(LineOutcome::Success),
    _ => Ok(LineOutcome::Continue),
  }
}
