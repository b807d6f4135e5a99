// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Single-consumer event loop over a bounded tokio channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{LatticeError, Result};

/// Actions performed in response to events of an [`EventLoop`].
#[async_trait]
pub trait EventAction<E>: Send + Sync {
    fn on_start(&self);

    fn on_stop(&self);

    /// Process one event. `tx_event` allows posting follow-up events.
    async fn on_receive(&self, event: E, tx_event: &mpsc::Sender<E>) -> Result<()>;

    /// Called with the error of a failed `on_receive`; the loop keeps running.
    fn on_error(&self, error: LatticeError);
}

/// Events are processed one at a time in posting order.
pub struct EventLoop<E> {
    pub name: String,
    pub buffer_size: usize,
    stopped: Arc<AtomicBool>,
    action: Arc<dyn EventAction<E>>,
    tx_event: Option<mpsc::Sender<E>>,
    handle: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> EventLoop<E> {
    pub fn new(
        name: impl Into<String>,
        buffer_size: usize,
        action: Arc<dyn EventAction<E>>,
    ) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            stopped: Arc::new(AtomicBool::new(false)),
            action,
            tx_event: None,
            handle: None,
        }
    }

    /// Spawn the processing task. Must be called within a tokio runtime.
    pub fn start(&mut self) -> Result<EventSender<E>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LatticeError::General(format!(
                "{} has already been stopped",
                self.name
            )));
        }
        if self.tx_event.is_some() {
            return Err(LatticeError::General(format!(
                "{} has already been started",
                self.name
            )));
        }
        self.action.on_start();

        let (tx_event, mut rx_event) = mpsc::channel::<E>(self.buffer_size.max(1));
        self.tx_event = Some(tx_event.clone());

        let name = self.name.clone();
        let stopped = self.stopped.clone();
        let action = self.action.clone();
        let tx_loop = tx_event.clone();
        self.handle = Some(tokio::spawn(async move {
            info!("Starting the event loop {name}");
            while !stopped.load(Ordering::SeqCst) {
                let Some(event) = rx_event.recv().await else {
                    info!("Event channel of {name} closed, shutting down");
                    break;
                };
                if let Err(e) = action.on_receive(event, &tx_loop).await {
                    error!("{name} failed to process event: {e}");
                    action.on_error(e);
                }
            }
            info!("The event loop {name} has been stopped");
        }));

        Ok(EventSender::new(tx_event))
    }

    /// Stop after the event being processed, if any. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.action.on_stop();
            if let Some(handle) = &self.handle {
                handle.abort();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn get_sender(&self) -> Result<EventSender<E>> {
        self.tx_event
            .as_ref()
            .cloned()
            .map(EventSender::new)
            .ok_or_else(|| {
                LatticeError::General(format!("{} has not been started", self.name))
            })
    }
}

impl<E> Drop for EventLoop<E> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Handle for posting events to an event loop.
#[derive(Clone)]
pub struct EventSender<E> {
    tx_event: mpsc::Sender<E>,
}

impl<E> EventSender<E> {
    pub fn new(tx_event: mpsc::Sender<E>) -> Self {
        Self { tx_event }
    }

    pub async fn post_event(&self, event: E) -> Result<()> {
        self.tx_event
            .send(event)
            .await
            .map_err(|e| LatticeError::General(format!("Fail to send event due to {e}")))
    }
}
