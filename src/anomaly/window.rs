//! Count-based tumbling windows, one sequence per partition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::anomaly::event::LogEvent;
use crate::anomaly::template::TemplateId;

/// A slice of one partition's event sequence, scored as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub window_id: String,
    pub partition: String,
    /// Events the window must hold before it may be scored
    pub size: usize,
    pub events: Vec<LogEvent>,
}

impl Window {
    pub fn new(window_id: impl Into<String>, partition: impl Into<String>, size: usize, events: Vec<LogEvent>) -> Self {
        Self {
            window_id: window_id.into(),
            partition: partition.into(),
            size,
            events,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.events.len() >= self.size
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn template_ids(&self) -> Vec<TemplateId> {
        self.events.iter().map(|event| event.template_id).collect()
    }
}

/// Buffers one partition's events until a full window is available
#[derive(Debug)]
pub(crate) struct WindowBuffer {
    partition: String,
    size: usize,
    buffered: Vec<LogEvent>,
    completed: u64,
    last_active: Option<DateTime<Utc>>,
}

impl WindowBuffer {
    pub(crate) fn new(partition: &str, size: usize) -> Self {
        Self {
            partition: partition.to_string(),
            size,
            buffered: Vec::with_capacity(size),
            completed: 0,
            last_active: None,
        }
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.last_active = Some(at);
    }

    pub(crate) fn last_active(&self) -> Option<DateTime<Utc>> {
        self.last_active
    }

    /// Append an event; returns the window it completes, if any
    pub(crate) fn push(&mut self, event: LogEvent) -> Option<Window> {
        self.buffered.push(event);
        if self.buffered.len() < self.size {
            return None;
        }

        self.completed += 1;
        let events = std::mem::replace(&mut self.buffered, Vec::with_capacity(self.size));
        Some(Window::new(
            window_id(&self.partition, self.completed),
            self.partition.clone(),
            self.size,
            events,
        ))
    }

    pub(crate) fn pending(&self) -> usize {
        self.buffered.len()
    }
}

fn window_id(partition: &str, sequence: u64) -> String {
    format!("{partition}-{sequence:06}")
}

/// Split events into complete windows per partition (source component),
/// dropping each partition's incomplete tail. Used to build training sets.
pub fn tumbling_windows(events: &[LogEvent], size: usize) -> Vec<Window> {
    let mut buffers: BTreeMap<&str, WindowBuffer> = BTreeMap::new();
    let mut windows = Vec::new();

    for event in events {
        let buffer = buffers
            .entry(event.source_component.as_str())
            .or_insert_with(|| WindowBuffer::new(&event.source_component, size));
        if let Some(window) = buffer.push(event.clone()) {
            windows.push(window);
        }
    }
    windows
}
