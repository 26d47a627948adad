//! Asynchronous notification dispatcher: a fixed pool of workers renders
//! queued jobs and hands them to a `Transport`. Exactly one result per job
//! reaches its submitter; a worker error becomes a job result, never a
//! crashed pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info};
use ulid::Ulid;

const QUEUE_DEPTH: usize = 1024;

/// One message to deliver. `payload` feeds the template's `{{field}}`
/// placeholders.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub template: String,
    pub attachments: Vec<PathBuf>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug)]
pub enum DeliveryError {
    Template(String),
    Transport(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Template(e) => write!(f, "template error: {e}"),
            DeliveryError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// The delivery seam. Real SMTP lives behind this; the default transport
/// just logs the rendered message.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn deliver(&self, message: &RenderedMessage) -> Result<(), DeliveryError>;
}

pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        info!(to = %message.to, subject = %message.subject, "mail delivered (log transport)");
        Ok(())
    }
}

/// Per-reservation delivery outcome, queryable over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Named plain-text templates with `{{field}}` interpolation from a JSON
/// object payload.
pub struct TemplateSet {
    templates: HashMap<String, String>,
}

impl TemplateSet {
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            "confirmation".to_string(),
            "Dear {{name}},\n\n\
             This is to confirm your reservation of {{room}} \
             from {{start_date}} to {{end_date}}.\n\n\
             We look forward to your stay.\n"
                .to_string(),
        );
        Self { templates }
    }

    pub fn insert(&mut self, name: &str, body: &str) {
        self.templates.insert(name.to_string(), body.to_string());
    }

    pub fn render(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<String, DeliveryError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| DeliveryError::Template(format!("unknown template: {name}")))?;

        let mut body = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some(open) = rest.find("{{") {
            body.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| DeliveryError::Template("unclosed placeholder".into()))?;
            let key = after[..close].trim();
            let value = payload
                .get(key)
                .and_then(|v| v.as_str())
                .ok_or_else(|| DeliveryError::Template(format!("missing field: {key}")))?;
            body.push_str(value);
            rest = &after[close + 2..];
        }
        body.push_str(rest);
        Ok(body)
    }
}

struct JobEnvelope {
    job: NotificationJob,
    result: oneshot::Sender<Result<(), DeliveryError>>,
}

pub struct Mailer {
    tx: mpsc::Sender<JobEnvelope>,
    status: DashMap<Ulid, DeliveryStatus>,
}

impl Mailer {
    /// Spawn `workers` tasks sharing one queue and return the handle.
    pub fn start(
        workers: usize,
        templates: TemplateSet,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<JobEnvelope>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let templates = Arc::new(templates);

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let templates = templates.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(envelope) = envelope else { break };
                    let result = handle_job(&templates, transport.as_ref(), &envelope.job).await;
                    // Submitter may have gone away; the send failing is fine.
                    let _ = envelope.result.send(result);
                }
            });
        }

        Arc::new(Self {
            tx,
            status: DashMap::new(),
        })
    }

    /// Queue a job; the returned receiver resolves with the delivery result.
    pub async fn submit(
        &self,
        job: NotificationJob,
    ) -> Result<oneshot::Receiver<Result<(), DeliveryError>>, DeliveryError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(JobEnvelope {
                job,
                result: result_tx,
            })
            .await
            .map_err(|_| DeliveryError::Transport("dispatcher shut down".into()))?;
        Ok(result_rx)
    }

    /// Queue a job for a reservation and track its outcome in the status
    /// table. Returns as soon as the job is queued; a spawned watcher
    /// records sent/failed when delivery resolves.
    pub async fn submit_tracked(self: &Arc<Self>, reservation_id: Ulid, job: NotificationJob) {
        self.status.insert(reservation_id, DeliveryStatus::Queued);
        match self.submit(job).await {
            Ok(result_rx) => {
                let mailer = self.clone();
                tokio::spawn(async move {
                    let outcome = match result_rx.await {
                        Ok(Ok(())) => DeliveryStatus::Sent,
                        Ok(Err(e)) => {
                            error!(reservation = %reservation_id, error = %e, "confirmation mail failed");
                            DeliveryStatus::Failed
                        }
                        Err(_) => {
                            error!(reservation = %reservation_id, "dispatcher dropped job result");
                            DeliveryStatus::Failed
                        }
                    };
                    match outcome {
                        DeliveryStatus::Sent => {
                            metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL)
                                .increment(1);
                        }
                        _ => {
                            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL)
                                .increment(1);
                        }
                    }
                    mailer.status.insert(reservation_id, outcome);
                });
            }
            Err(e) => {
                error!(reservation = %reservation_id, error = %e, "could not queue confirmation mail");
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                self.status.insert(reservation_id, DeliveryStatus::Failed);
            }
        }
    }

    pub fn status(&self, reservation_id: &Ulid) -> Option<DeliveryStatus> {
        self.status.get(reservation_id).map(|e| *e.value())
    }
}

async fn handle_job(
    templates: &TemplateSet,
    transport: &dyn Transport,
    job: &NotificationJob,
) -> Result<(), DeliveryError> {
    let body = templates.render(&job.template, &job.payload)?;
    let message = RenderedMessage {
        from: job.from.clone(),
        to: job.to.clone(),
        subject: job.subject.clone(),
        body,
        attachments: job.attachments.clone(),
    };
    transport.deliver(&message).await
}
