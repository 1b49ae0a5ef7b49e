use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::backend::{GenerationBackend, Prompt};
use crate::errors::GenerationError;

struct GenerationRequest {
    prompt: Prompt,
    reply: oneshot::Sender<Result<String, GenerationError>>,
}

/// FIFO in front of a backend that must not see parallel calls.
///
/// One worker task owns the backend; callers from any number of jobs enqueue
/// a prompt and await their own reply.
#[derive(Clone)]
pub struct GenerationQueue {
    tx: mpsc::Sender<GenerationRequest>,
}

impl GenerationQueue {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn spawn(backend: Arc<dyn GenerationBackend>, capacity: usize, timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<GenerationRequest>(capacity.max(1));

        tokio::spawn(async move {
            tracing::info!("Generation worker started for backend '{}'", backend.name());
            while let Some(request) = rx.recv().await {
                let result = complete_with_timeout(backend.as_ref(), &request.prompt, timeout).await;
                if request.reply.send(result).is_err() {
                    tracing::debug!("Generation caller went away before its reply");
                }
            }
            tracing::info!("Generation worker stopped");
        });

        Self { tx }
    }

    pub async fn submit(&self, prompt: Prompt) -> Result<String, GenerationError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(GenerationRequest { prompt, reply })
            .await
            .map_err(|_| GenerationError::Unavailable("generation queue closed".to_string()))?;

        response.await.map_err(|_| {
            GenerationError::Unavailable("generation worker dropped the request".to_string())
        })?
    }
}

pub(crate) async fn complete_with_timeout(
    backend: &dyn GenerationBackend,
    prompt: &Prompt,
    timeout: Duration,
) -> Result<String, GenerationError> {
    match tokio::time::timeout(timeout, backend.complete(prompt)).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl GenerationBackend for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn complete(&self, prompt: &Prompt) -> Result<String, GenerationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(prompt.user.clone())
        }
    }

    fn prompt(user: &str) -> Prompt {
        Prompt {
            system: "sys".into(),
            user: user.into(),
            max_output_tokens: 10,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn serialises_concurrent_callers() {
        let probe = Arc::new(Probe {
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let queue = GenerationQueue::spawn(probe.clone(), 4, Duration::from_secs(1));

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.submit(prompt(&i.to_string())).await }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i.to_string());
        }
        assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        struct Stuck;

        #[async_trait]
        impl GenerationBackend for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }

            async fn complete(&self, _prompt: &Prompt) -> Result<String, GenerationError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(String::new())
            }
        }

        let queue = GenerationQueue::spawn(Arc::new(Stuck), 1, Duration::from_millis(20));
        assert_eq!(
            queue.submit(prompt("x")).await,
            Err(GenerationError::Timeout(Duration::from_millis(20)))
        );
    }
}
