use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};

use crate::promtun::{
    telemetry,
    tunnel::{
        TunnelSettings,
        backoff::Backoff,
        connector::{ConnectError, GatewayDialer},
        relay::{self, Destination},
        stopped,
        transport::BoxedStream,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Relaying,
    BackoffWait(Duration),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connected,
    ConnectFailed,
    RelayEnded,
    BackoffElapsed,
    Stopped,
}

/// Pure transition function of the per-tunnel state machine.
pub fn transition(state: TunnelState, event: Event, backoff: &mut Backoff) -> TunnelState {
    use TunnelState::*;
    match (state, event) {
        (_, Event::Stopped) => Closed,
        (Connecting, Event::Connected) => {
            backoff.reset();
            Relaying
        }
        (Connecting, Event::ConnectFailed) => BackoffWait(backoff.next_delay()),
        (Relaying, Event::RelayEnded) => {
            backoff.reset();
            Connecting
        }
        (BackoffWait(_), Event::BackoffElapsed) => Connecting,
        (s, _) => s,
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one running tunnel task. Dropping the handle stops the tunnel.
pub struct Tunnel {
    id: u64,
    stop: watch::Sender<bool>,
    state: watch::Receiver<TunnelState>,
    task: Option<JoinHandle<()>>,
}

impl Tunnel {
    pub fn spawn(
        dialer: Arc<dyn GatewayDialer>,
        destination: Arc<Destination>,
        settings: Arc<TunnelSettings>,
    ) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(TunnelState::Connecting);

        let task = tokio::spawn(drive(dialer, destination, settings, stop_rx, state_tx));

        Self {
            id,
            stop,
            state,
            task: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// Requests stop. Interrupts a pending dial, the relay or a backoff sleep.
    pub fn close(&self) {
        self.stop.send_replace(true);
    }

    /// Waits for the tunnel task to finish.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

async fn drive(
    dialer: Arc<dyn GatewayDialer>,
    destination: Arc<Destination>,
    settings: Arc<TunnelSettings>,
    mut stop: watch::Receiver<bool>,
    state_tx: watch::Sender<TunnelState>,
) {
    let endpoint = dialer.endpoint().to_string();
    let mut backoff = Backoff::new(settings.backoff);
    let mut state = TunnelState::Connecting;
    let mut conn: Option<BoxedStream> = None;
    let mut last_err: Option<ConnectError> = None;

    loop {
        if *stop.borrow() {
            state = transition(state, Event::Stopped, &mut backoff);
        }
        state_tx.send_replace(state);

        let event = match state {
            TunnelState::Closed => break,
            TunnelState::Connecting => tokio::select! {
                biased;
                _ = stopped(&mut stop) => Event::Stopped,
                res = dialer.connect() => match res {
                    Ok(c) => {
                        metrics::counter!(telemetry::TUNNEL_CONNECTS_TOTAL, "result" => "ok").increment(1);
                        conn = Some(c);
                        Event::Connected
                    }
                    Err(err) => {
                        metrics::counter!(telemetry::TUNNEL_CONNECTS_TOTAL, "result" => "error").increment(1);
                        last_err = Some(err);
                        Event::ConnectFailed
                    }
                },
            },
            TunnelState::Relaying => match conn.take() {
                Some(c) => {
                    match relay::relay(c, destination.clone(), settings.clone(), stop.clone()).await {
                        Ok(()) => Event::Stopped,
                        Err(err) => {
                            tracing::warn!(endpoint = %endpoint, err = %err, "tunnel: connection lost, reconnecting");
                            Event::RelayEnded
                        }
                    }
                }
                None => Event::RelayEnded,
            },
            TunnelState::BackoffWait(d) => tokio::select! {
                biased;
                _ = stopped(&mut stop) => Event::Stopped,
                _ = tokio::time::sleep(d) => Event::BackoffElapsed,
            },
        };

        state = transition(state, event, &mut backoff);

        if let (TunnelState::BackoffWait(d), Some(err)) = (state, last_err.take()) {
            tracing::error!(
                endpoint = %endpoint,
                backoff = %humantime::format_duration(d),
                err = %err,
                "tunnel: connect failed"
            );
        }
    }

    drop(conn);
    tracing::info!(endpoint = %endpoint, "tunnel: stopped");
}
