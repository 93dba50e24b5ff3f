use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use tokio::sync::watch;

use crate::promtun::{
    telemetry,
    tunnel::{
        TunnelSettings,
        backoff::Backoff,
        connector::DialerFactory,
        lifecycle::Tunnel,
        relay::Destination,
        resolver::EndpointResolver,
        stopped,
    },
};

/// Outcome of one reconciliation, both lists sorted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

/// Keeps exactly one tunnel per endpoint the resolver currently returns.
pub struct Manager {
    resolver: Arc<dyn EndpointResolver>,
    dialers: Arc<dyn DialerFactory>,
    destination: Arc<Destination>,
    settings: Arc<TunnelSettings>,
    tunnels: HashMap<String, Tunnel>,
    backoff: Backoff,
}

impl Manager {
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        dialers: Arc<dyn DialerFactory>,
        destination: Arc<Destination>,
        settings: Arc<TunnelSettings>,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff);
        Self {
            resolver,
            dialers,
            destination,
            settings,
            tunnels: HashMap::new(),
            backoff,
        }
    }

    /// Starts a tunnel for every new endpoint and stops every tunnel whose
    /// endpoint is gone. Tunnels for endpoints in both sets are left alone.
    pub fn reconcile(&mut self, desired: &[String]) -> Reconciled {
        let desired: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
        let mut out = Reconciled::default();

        let mut gone: Vec<String> = self
            .tunnels
            .keys()
            .filter(|ep| !desired.contains(ep.as_str()))
            .cloned()
            .collect();
        gone.sort();
        for ep in gone {
            if let Some(t) = self.tunnels.remove(&ep) {
                tracing::info!(endpoint = %ep, id = t.id(), state = ?t.state(), "tunnel: stopping");
                t.close();
            }
            out.stopped.push(ep);
        }

        for ep in desired {
            if self.tunnels.contains_key(ep) {
                continue;
            }
            let t = Tunnel::spawn(
                self.dialers.dialer(ep),
                self.destination.clone(),
                self.settings.clone(),
            );
            tracing::info!(endpoint = %ep, id = t.id(), "tunnel: starting");
            self.tunnels.insert(ep.to_string(), t);
            out.started.push(ep.to_string());
        }

        metrics::gauge!(telemetry::TUNNELS).set(self.tunnels.len() as f64);
        out
    }

    /// One resolution round. Returns how long to wait before the next one.
    pub async fn step(&mut self) -> Duration {
        match self.resolver.resolve().await {
            Ok(endpoints) => {
                metrics::counter!(telemetry::RESOLVE_TOTAL, "result" => "ok").increment(1);
                self.backoff.reset();
                tracing::info!(endpoints = ?endpoints, "resolver: desired endpoints");
                let r = self.reconcile(&endpoints);
                if !r.started.is_empty() || !r.stopped.is_empty() {
                    tracing::info!(started = ?r.started, stopped = ?r.stopped, "tunnel: reconciled");
                }
                self.settings.refresh_interval
            }
            Err(err) => {
                metrics::counter!(telemetry::RESOLVE_TOTAL, "result" => "error").increment(1);
                let d = self.backoff.next_delay();
                tracing::error!(
                    err = %err,
                    backoff = %humantime::format_duration(d),
                    "resolver: failed to get endpoints"
                );
                d
            }
        }
    }

    /// Resolves immediately, then after every returned delay, until stopped.
    /// Every tunnel is stopped before this returns.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            let delay = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                d = self.step() => d,
            };
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.close_all().await;
    }

    /// Stops every tunnel and waits for their tasks to finish.
    pub async fn close_all(&mut self) {
        let tunnels: Vec<Tunnel> = self.tunnels.drain().map(|(_, t)| t).collect();
        for t in &tunnels {
            t.close();
        }
        for t in tunnels {
            t.join().await;
        }
        metrics::gauge!(telemetry::TUNNELS).set(0.0);
    }

    #[cfg(test)]
    pub fn endpoints(&self) -> Vec<String> {
        let mut eps: Vec<String> = self.tunnels.keys().cloned().collect();
        eps.sort();
        eps
    }

    #[cfg(test)]
    pub fn tunnel_id(&self, endpoint: &str) -> Option<u64> {
        self.tunnels.get(endpoint).map(Tunnel::id)
    }
}
