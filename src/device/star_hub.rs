// src/device/star_hub.rs
//! Several cards behind one clock and trigger
//!
//! The master card drives the shared clock and owns the trigger; every other
//! child is configured with an empty trigger and follows the master through
//! the sync bus. Calls fan out to one scoped thread per child and results are
//! gathered in child order.

use crossbeam::thread;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use tracing::{debug, info, warn};

use super::{Awg, CancellationToken, Card, Configurable, DeviceState, Digitiser, Startable, Streamable};
use crate::acquisition::Measurement;
use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::{self, command, features};
use crate::hal::{FaultCode, Register, RegisterInterface};
use crate::settings::TriggerSettings;

// Registers that must read back identically on every child after configure
const SHARED_SETTINGS: [Register; 5] = [
    registers::SAMPLE_RATE,
    registers::CHANNEL_ENABLE,
    registers::CARD_MODE,
    registers::MEMORY_SIZE,
    registers::SEGMENT_SIZE,
];

/// Ordered children acting as one card
#[derive(Debug)]
pub struct StarHub<D> {
    children: Vec<D>,
    master: usize,
}

impl<D: Card + Send> StarHub<D> {
    /// Join `children` on the sync bus with `children[master]` as clock master
    ///
    /// The master's sync registers are written before any subordinate's.
    pub fn new(children: Vec<D>, master: usize) -> CardResult<Self> {
        if children.is_empty() || master >= children.len() {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                format!("master {} outside a hub of {} cards", master, children.len()),
            ));
        }
        if !children[master].core().profile().has_feature(features::STARHUB) {
            return Err(
                CardError::config(ConfigRule::FeatureNotSupported, "master card has no star-hub").in_child(master),
            );
        }
        let enable_mask = (0..children.len()).fold(0i64, |mask, i| mask | (1 << i));
        let master_core = children[master].core();
        master_core
            .write(registers::SYNC_ENABLE_MASK, enable_mask)
            .and_then(|_| master_core.write(registers::SYNC_CLOCK_MASK, 1 << master))
            .map_err(|err| err.in_child(master))?;
        for (i, child) in children.iter().enumerate().filter(|(i, _)| *i != master) {
            child
                .core()
                .write(registers::SYNC_ENABLE_MASK, enable_mask)
                .map_err(|err| err.in_child(i))?;
        }
        info!(cards = children.len(), master, "star-hub connected");
        Ok(Self { children, master })
    }

    pub fn children(&self) -> &[D] {
        &self.children
    }

    pub fn child(&self, index: usize) -> Option<&D> {
        self.children.get(index)
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut D> {
        self.children.get_mut(index)
    }

    pub fn master_index(&self) -> usize {
        self.master
    }

    pub fn master(&self) -> &D {
        &self.children[self.master]
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Give the children back without disconnecting them
    pub fn into_children(self) -> Vec<D> {
        self.children
    }

    /// Disconnect every child; the first failure is reported after all were tried
    pub fn disconnect(&mut self) -> CardResult<()> {
        let mut first = None;
        for (i, child) in self.children.iter_mut().enumerate() {
            if let Err(err) = child.disconnect() {
                warn!(child = i, %err, "fault disconnecting hub child");
                first.get_or_insert(err.in_child(i));
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Run `op` on every child except `skip`, one thread each
    ///
    /// Waits for all threads. On failure the first error by child index is
    /// returned, preferring real faults over cancellations.
    fn fan_out<T, F>(&mut self, skip: Option<usize>, op: F) -> CardResult<Vec<(usize, T)>>
    where
        T: Send,
        F: Fn(usize, &mut D) -> CardResult<T> + Sync,
    {
        let op = &op;
        let joined = thread::scope(|scope| {
            let handles: Vec<_> = self
                .children
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .map(|(i, child)| (i, scope.spawn(move |_| op(i, child))))
                .collect();
            handles
                .into_iter()
                .map(|(i, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(CardError::from_fault(FaultCode::INTERNAL, "hub worker panicked")));
                    (i, result)
                })
                .collect::<Vec<_>>()
        })
        .map_err(|_| CardError::from_fault(FaultCode::INTERNAL, "hub worker panicked"))?;

        let mut values = Vec::with_capacity(joined.len());
        let mut cancelled = None;
        let mut failed = None;
        for (i, result) in joined {
            match result {
                Ok(value) => values.push((i, value)),
                Err(CardError::Cancelled) => {
                    cancelled.get_or_insert(i);
                }
                Err(err) => {
                    if failed.is_none() {
                        failed = Some(err.in_child(i));
                    }
                }
            }
        }
        if let Some(err) = failed {
            return Err(err);
        }
        if let Some(i) = cancelled {
            return Err(CardError::Cancelled.in_child(i));
        }
        Ok(values)
    }

    fn stop_running_children(&mut self) {
        for (i, child) in self.children.iter_mut().enumerate() {
            if child.core().state() == DeviceState::Running {
                child.core().stop_quietly();
                child.core_mut().set_state(DeviceState::Stopped);
                debug!(child = i, "hub child stopped after failure");
            }
        }
    }
}

impl<D> Configurable for StarHub<D>
where
    D: Card + Configurable + Send,
{
    type Settings = D::Settings;

    fn validate_settings(&self, settings: &D::Settings, trigger: &TriggerSettings) -> CardResult<()> {
        let none = TriggerSettings::none();
        for (i, child) in self.children.iter().enumerate() {
            let trigger = if i == self.master { trigger } else { &none };
            child.validate_settings(settings, trigger).map_err(|err| err.in_child(i))?;
        }
        Ok(())
    }

    /// Validate on every child, configure the master, then the rest in parallel
    ///
    /// Shared timing registers are read back afterwards; any difference from
    /// the master is a configuration mismatch.
    fn configure(&mut self, settings: &D::Settings, trigger: &TriggerSettings) -> CardResult<()> {
        self.validate_settings(settings, trigger)?;
        let master = self.master;
        self.children[master]
            .configure(settings, trigger)
            .map_err(|err| err.in_child(master))?;
        let none = TriggerSettings::none();
        self.fan_out(Some(master), |_, child| child.configure(settings, &none))?;

        let master_core = self.children[master].core();
        for register in SHARED_SETTINGS {
            let expected = master_core.read(register).map_err(|err| err.in_child(master))?;
            for (i, child) in self.children.iter().enumerate().filter(|(i, _)| *i != master) {
                let actual = child.core().read(register).map_err(|err| err.in_child(i))?;
                if actual != expected {
                    return Err(CardError::config(
                        ConfigRule::SettingsMismatch,
                        format!("{} reads {} but the master holds {}", register, actual, expected),
                    )
                    .in_child(i));
                }
            }
        }
        debug!(cards = self.children.len(), "star-hub configured");
        Ok(())
    }
}

impl<D> Startable for StarHub<D>
where
    D: Card + Startable + Send,
{
    /// State of the master card
    fn state(&self) -> DeviceState {
        self.children[self.master].state()
    }

    /// Start every child in lock-step behind a barrier
    ///
    /// If any child fails the ones that did start are stopped again.
    fn start(&mut self) -> CardResult<()> {
        let barrier = Barrier::new(self.children.len());
        let outcome = self.fan_out(None, |_, child| {
            barrier.wait();
            child.start()
        });
        if let Err(err) = outcome {
            self.stop_running_children();
            return Err(err);
        }
        debug!(cards = self.children.len(), "star-hub started");
        Ok(())
    }

    fn stop(&mut self) -> CardResult<()> {
        self.fan_out(None, |_, child| child.stop())?;
        Ok(())
    }
}

// Stop every card but `failed`; their pending waits return with an abort
fn abort_siblings(handles: &[Arc<dyn RegisterInterface>], failed: usize) {
    for (i, io) in handles.iter().enumerate().filter(|(i, _)| *i != failed) {
        if let Err(code) = io.write(registers::CARD_COMMAND, command::CARD_STOP | command::DATA_STOP_DMA) {
            warn!(child = i, %code, "fault stopping hub child after sibling failure");
        }
    }
    debug!(failed, "hub siblings stopped");
}

// Combine per-child batches index by index, keeping the master's timestamps
fn merge_batches(per_child: Vec<(usize, Vec<Measurement>)>, master: usize) -> Vec<Measurement> {
    let batch = per_child.iter().map(|(_, m)| m.len()).min().unwrap_or(0);
    let timestamps: Vec<_> = per_child
        .iter()
        .find(|(i, _)| *i == master)
        .map(|(_, m)| m.iter().map(|m| m.timestamp).collect())
        .unwrap_or_default();
    let mut columns: Vec<_> = per_child.into_iter().map(|(_, m)| m.into_iter()).collect();
    (0..batch)
        .map(|k| {
            let mut merged = Measurement::merge(columns.iter_mut().filter_map(Iterator::next));
            merged.timestamp = timestamps.get(k).copied().flatten();
            merged
        })
        .collect()
}

impl<D> Streamable for StarHub<D>
where
    D: Card + Streamable + Send,
{
    fn batch_size(&self) -> usize {
        self.children[self.master].batch_size()
    }

    fn execute_finite_fifo_acquisition(&mut self, count: usize) -> CardResult<Vec<Measurement>> {
        let batch = self.batch_size();
        if count == 0 || count % batch != 0 {
            return Err(CardError::config(
                ConfigRule::BatchSize,
                format!("{} measurements is not a whole number of batches of {}", count, batch),
            ));
        }
        self.start()?;
        let cancel = CancellationToken::new();
        let mut measurements = Vec::with_capacity(count);
        while measurements.len() < count {
            match self.next_measurements(&cancel) {
                Ok(batch) => measurements.extend(batch),
                Err(err) => {
                    self.stop_running_children();
                    return Err(err);
                }
            }
        }
        self.stop()?;
        Ok(measurements)
    }

    fn execute_continuous_fifo_acquisition(&mut self) -> CardResult<()> {
        self.start()
    }

    /// One merged batch; a failing child cancels its siblings' waits
    fn next_measurements(&mut self, cancel: &CancellationToken) -> CardResult<Vec<Measurement>> {
        let local = cancel.child();
        let per_child = self.fan_out(None, |_, child| {
            let result = child.next_measurements(&local);
            if result.is_err() {
                local.cancel();
            }
            result
        })?;
        Ok(merge_batches(per_child, self.master))
    }
}

impl StarHub<Digitiser> {
    /// Start all children together, retrieve every record and merge them
    ///
    /// The first child to fail stops its siblings through their own handles,
    /// so none is left waiting for a record that will not be merged. The
    /// failing child keeps its state; a timed-out card stays running.
    pub fn execute_standard_single_acquisition(&mut self) -> CardResult<Measurement> {
        self.start()?;
        let handles: Vec<Arc<dyn RegisterInterface>> = self.children.iter().map(|c| c.core().shared_io()).collect();
        let aborted = AtomicBool::new(false);
        let per_child = self.fan_out(None, |i, child| {
            let result = child
                .wait_for_acquisition_to_complete()
                .and_then(|()| child.retrieve_standard_single_measurement());
            match result {
                Ok(measurement) => Ok(vec![measurement]),
                Err(_) if aborted.load(Ordering::Acquire) => {
                    child.core_mut().set_state(DeviceState::Stopped);
                    Err(CardError::Cancelled)
                }
                Err(err) => {
                    if !aborted.swap(true, Ordering::AcqRel) {
                        abort_siblings(&handles, i);
                    }
                    Err(err)
                }
            }
        })?;
        self.stop()?;
        merge_batches(per_child, self.master)
            .pop()
            .ok_or_else(|| CardError::from_fault(FaultCode::INTERNAL, "hub produced no measurement"))
    }
}

impl StarHub<Awg> {
    /// Start replay on all children; finite loop counts wait and stop
    pub fn execute_standard_single_generation(&mut self) -> CardResult<()> {
        self.start()?;
        let finite = self
            .master()
            .settings()
            .is_some_and(|settings| settings.num_loops > 0);
        if finite {
            self.fan_out(None, |_, child| child.wait_for_generation_to_complete())?;
            self.stop()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn measurement(channels: usize, value: f32, second: Option<u32>) -> Measurement {
        let timestamp = second.map(|s| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, s).unwrap());
        Measurement::new(vec![vec![value; 4]; channels], timestamp)
    }

    #[test]
    fn test_merge_keeps_child_order_and_master_time() {
        let per_child = vec![
            (0, vec![measurement(2, 0.0, Some(1)), measurement(2, 0.5, Some(2))]),
            (1, vec![measurement(1, 1.0, Some(9)), measurement(1, 1.5, Some(9))]),
        ];
        let merged = merge_batches(per_child, 1);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].num_channels(), 3);
        assert_eq!(merged[1].waveforms[2][0], 1.5);
        assert_eq!(merged[0].timestamp, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 9).unwrap()));
    }

    #[test]
    fn test_merge_without_timestamps() {
        let per_child = vec![(0, vec![measurement(1, 0.0, None)]), (1, vec![measurement(1, 0.0, None)])];
        let merged = merge_batches(per_child, 0);
        assert_eq!(merged[0].timestamp, None);
        assert_eq!(merged[0].samples_per_channel(), 4);
    }
}
