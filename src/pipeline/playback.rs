//! Playback sequencing, speaking state and barge-in
//!
//! Synthesis for later fragments can finish before earlier ones. The sequencer
//! holds audio back until every earlier fragment of the same turn has been
//! delivered, so the caller always hears a reply in generation order. Turns are
//! delivered one after another: audio for the next turn is buffered until the
//! current turn is fully delivered or cut off by a barge-in.
//!
//! Each fragment delivered to the bridge is followed by a uniquely named mark.
//! The caller is considered to be hearing audio while any mark is unacknowledged.
//!
//! Out-of-band audio skips ordering but not barge-in: once a barge-in clears an
//! out-of-band fragment that has started playing, the rest of its stream is
//! dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::PlaybackConfig;
use crate::telephony::OutboundEvent;

/// Audio for one fragment that is not yet due for delivery
#[derive(Debug, Default)]
struct PendingFragment {
    chunks: Vec<Bytes>,
    complete: bool,
}

/// Re-orders fragment audio into delivery order and owns the bridge sink
#[derive(Debug)]
pub struct PlaybackSequencer {
    stream_sid: String,
    outbound: mpsc::Sender<OutboundEvent>,
    /// Interaction whose fragments are being delivered
    current_interaction: u64,
    expected_fragment: u32,
    /// Out-of-order audio keyed by (interaction, fragment)
    pending: BTreeMap<(u64, u32), PendingFragment>,
    /// Fragment totals reported by finished completions
    fragment_counts: HashMap<u64, u32>,
    outstanding_marks: HashSet<String>,
    /// Mark reserved for the fragment currently streaming
    live_mark: Option<String>,
    /// Mark reserved for the out-of-band fragment currently streaming
    out_of_band_mark: Option<String>,
    /// A barge-in cut off the out-of-band fragment still streaming
    out_of_band_cancelled: bool,
    last_played: Option<u64>,
    last_activity: Instant,
    last_barge_in: Option<Instant>,
    delivered: Vec<u64>,
    barge_in_cooldown: Duration,
    inactivity_timeout: Duration,
}

impl PlaybackSequencer {
    /// Create a sequencer that starts delivering at `first_interaction`
    #[must_use]
    pub fn new(
        stream_sid: impl Into<String>,
        outbound: mpsc::Sender<OutboundEvent>,
        first_interaction: u64,
        config: &PlaybackConfig,
    ) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            outbound,
            current_interaction: first_interaction,
            expected_fragment: 0,
            pending: BTreeMap::new(),
            fragment_counts: HashMap::new(),
            outstanding_marks: HashSet::new(),
            live_mark: None,
            out_of_band_mark: None,
            out_of_band_cancelled: false,
            last_played: None,
            last_activity: Instant::now(),
            last_barge_in: None,
            delivered: Vec::new(),
            barge_in_cooldown: config.barge_in_cooldown,
            inactivity_timeout: config.inactivity_timeout,
        }
    }

    #[must_use]
    pub const fn current_interaction(&self) -> u64 {
        self.current_interaction
    }

    #[must_use]
    pub const fn expected_fragment(&self) -> u32 {
        self.expected_fragment
    }

    /// Fragments buffered out of order
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Interaction whose audio was most recently sent to the bridge
    #[must_use]
    pub const fn last_played(&self) -> Option<u64> {
        self.last_played
    }

    #[must_use]
    pub fn outstanding_marks(&self) -> usize {
        self.outstanding_marks.len()
    }

    /// Interactions whose audio has been fully delivered since the last call
    pub fn take_delivered(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.delivered)
    }

    /// Hand one audio sub-chunk to the sequencer
    ///
    /// `fragment` is `None` for out-of-band audio, which bypasses ordering.
    pub async fn deliver_chunk(&mut self, interaction: u64, fragment: Option<u32>, chunk: Bytes) {
        let Some(fragment) = fragment else {
            if self.out_of_band_cancelled {
                tracing::debug!(interaction, "dropping cancelled out-of-band audio");
                return;
            }
            if self.out_of_band_mark.is_none() {
                self.out_of_band_mark = Some(self.reserve_mark());
            }
            self.send_media(&chunk).await;
            return;
        };

        if interaction < self.current_interaction
            || (interaction == self.current_interaction && fragment < self.expected_fragment)
        {
            tracing::debug!(interaction, fragment, "dropping stale audio");
            return;
        }

        if interaction == self.current_interaction && fragment == self.expected_fragment {
            if self.live_mark.is_none() {
                self.live_mark = Some(self.reserve_mark());
            }
            self.last_played = Some(interaction);
            self.send_media(&chunk).await;
            return;
        }

        self.pending
            .entry((interaction, fragment))
            .or_default()
            .chunks
            .push(chunk);
    }

    /// A fragment's synthesis finished
    ///
    /// Failed and duplicate fragments are completed without audio so the
    /// fragments behind them are not held back.
    pub async fn complete_fragment(&mut self, interaction: u64, fragment: Option<u32>) {
        let Some(fragment) = fragment else {
            if std::mem::take(&mut self.out_of_band_cancelled) {
                return;
            }
            if let Some(name) = self.out_of_band_mark.take() {
                self.send_mark(name).await;
            }
            return;
        };

        if interaction < self.current_interaction
            || (interaction == self.current_interaction && fragment < self.expected_fragment)
        {
            return;
        }

        if interaction == self.current_interaction && fragment == self.expected_fragment {
            self.advance().await;
            self.drain().await;
            return;
        }

        self.pending.entry((interaction, fragment)).or_default().complete = true;
    }

    /// The language model produced all `fragment_count` fragments of a turn
    pub async fn finish_turn(&mut self, interaction: u64, fragment_count: u32) {
        if interaction < self.current_interaction {
            return;
        }
        self.fragment_counts.insert(interaction, fragment_count);
        if interaction == self.current_interaction {
            self.drain().await;
        }
    }

    /// The bridge acknowledged a mark
    pub fn mark_acked(&mut self, name: &str) {
        self.last_activity = Instant::now();
        if self.outstanding_marks.remove(name) {
            tracing::trace!(mark = %name, remaining = self.outstanding_marks.len(), "mark acknowledged");
        }
    }

    /// Whether reply audio is still playing to the caller
    pub fn is_speaking(&mut self) -> bool {
        self.check_liveness();
        !self.outstanding_marks.is_empty()
    }

    /// Drop a stuck speaking state after a lost acknowledgment
    ///
    /// Returns true if the state was reset.
    pub fn check_liveness(&mut self) -> bool {
        if self.outstanding_marks.is_empty() || self.last_activity.elapsed() < self.inactivity_timeout {
            return false;
        }

        tracing::warn!(
            outstanding = self.outstanding_marks.len(),
            idle_ms = u64::try_from(self.last_activity.elapsed().as_millis()).unwrap_or(u64::MAX),
            "no playback activity, resetting speaking state"
        );
        self.outstanding_marks.clear();
        self.live_mark = None;
        self.out_of_band_mark = None;
        true
    }

    /// Cancel playback of the turn the caller is talking over
    ///
    /// Rate limited to one clear per cooldown window. Returns true if a clear
    /// was sent. Audio still in flight for the interrupted turn is discarded
    /// when it arrives.
    pub async fn barge_in(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_barge_in
            && now.duration_since(last) < self.barge_in_cooldown
        {
            tracing::debug!("ignoring barge-in within cooldown");
            return false;
        }
        self.last_barge_in = Some(now);

        let clear = OutboundEvent::clear(&self.stream_sid);
        self.emit(clear).await;

        self.outstanding_marks.clear();
        self.live_mark = None;
        self.out_of_band_cancelled = self.out_of_band_mark.take().is_some();
        self.last_activity = now;

        if self.last_played == Some(self.current_interaction) {
            self.current_interaction += 1;
            self.expected_fragment = 0;
        }

        let current = self.current_interaction;
        self.pending.retain(|(interaction, _), _| *interaction >= current);
        self.fragment_counts.retain(|interaction, _| *interaction >= current);

        tracing::info!(next_interaction = current, "barge-in, playback cleared");

        self.drain().await;
        true
    }

    /// Close the fragment that just finished streaming and move to the next one
    async fn advance(&mut self) {
        if let Some(name) = self.live_mark.take() {
            self.send_mark(name).await;
        }
        self.expected_fragment += 1;
    }

    /// Deliver buffered fragments that are now due, rolling over finished turns
    async fn drain(&mut self) {
        loop {
            let key = (self.current_interaction, self.expected_fragment);
            if let Some(entry) = self.pending.remove(&key) {
                if !entry.chunks.is_empty() {
                    if self.live_mark.is_none() {
                        self.live_mark = Some(self.reserve_mark());
                    }
                    self.last_played = Some(self.current_interaction);
                    for chunk in &entry.chunks {
                        self.send_media(chunk).await;
                    }
                }
                if !entry.complete {
                    // remaining chunks stream live
                    return;
                }
                self.advance().await;
                continue;
            }

            let finished = self
                .fragment_counts
                .get(&self.current_interaction)
                .is_some_and(|count| self.expected_fragment >= *count);
            if !finished {
                return;
            }

            self.fragment_counts.remove(&self.current_interaction);
            self.delivered.push(self.current_interaction);
            tracing::debug!(interaction = self.current_interaction, "turn delivered");
            self.current_interaction += 1;
            self.expected_fragment = 0;
        }
    }

    fn reserve_mark(&mut self) -> String {
        let name = uuid::Uuid::new_v4().to_string();
        self.outstanding_marks.insert(name.clone());
        name
    }

    async fn send_media(&mut self, chunk: &[u8]) {
        self.last_activity = Instant::now();
        let event = OutboundEvent::media(&self.stream_sid, STANDARD.encode(chunk));
        self.emit(event).await;
    }

    async fn send_mark(&mut self, name: String) {
        let event = OutboundEvent::mark(&self.stream_sid, name);
        self.emit(event).await;
    }

    async fn emit(&self, event: OutboundEvent) {
        if self.outbound.send(event).await.is_err() {
            tracing::debug!("bridge writer closed, dropping outbound event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer(first_interaction: u64) -> (PlaybackSequencer, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let seq = PlaybackSequencer::new("MZ1", tx, first_interaction, &PlaybackConfig::default());
        (seq, rx)
    }

    /// Decoded media payloads and the count of other events
    fn drain_media(rx: &mut mpsc::Receiver<OutboundEvent>) -> (Vec<Vec<u8>>, usize, usize) {
        let mut media = Vec::new();
        let mut marks = 0;
        let mut clears = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                OutboundEvent::Media { media: m, .. } => {
                    media.push(STANDARD.decode(m.payload).unwrap());
                }
                OutboundEvent::Mark { .. } => marks += 1,
                OutboundEvent::Clear { .. } => clears += 1,
            }
        }
        (media, marks, clears)
    }

    async fn whole_fragment(seq: &mut PlaybackSequencer, interaction: u64, fragment: u32, byte: u8) {
        seq.deliver_chunk(interaction, Some(fragment), Bytes::from(vec![byte, 0]))
            .await;
        seq.deliver_chunk(interaction, Some(fragment), Bytes::from(vec![byte, 1]))
            .await;
        seq.complete_fragment(interaction, Some(fragment)).await;
    }

    // -- Ordering -------------------------------------------------------------

    #[tokio::test]
    async fn out_of_order_fragments_are_delivered_in_order() {
        let (mut seq, mut rx) = sequencer(0);

        whole_fragment(&mut seq, 0, 2, 2).await;
        whole_fragment(&mut seq, 0, 0, 0).await;
        whole_fragment(&mut seq, 0, 1, 1).await;

        let (media, marks, _) = drain_media(&mut rx);
        assert_eq!(
            media,
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1], vec![2, 0], vec![2, 1]]
        );
        assert_eq!(marks, 3);
        assert_eq!(seq.expected_fragment(), 3);
        assert_eq!(seq.pending_len(), 0);
    }

    #[tokio::test]
    async fn expected_fragment_streams_before_completion() {
        let (mut seq, mut rx) = sequencer(0);

        seq.deliver_chunk(0, Some(1), Bytes::from_static(b"b")).await;
        seq.deliver_chunk(0, Some(0), Bytes::from_static(b"a")).await;
        let (media, _, _) = drain_media(&mut rx);
        assert_eq!(media, vec![b"a".to_vec()]);
        assert!(seq.is_speaking());

        seq.complete_fragment(0, Some(0)).await;
        seq.deliver_chunk(0, Some(1), Bytes::from_static(b"c")).await;
        let (media, marks, _) = drain_media(&mut rx);
        assert_eq!(media, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(marks, 1);
    }

    #[tokio::test]
    async fn failed_fragment_does_not_block_successors() {
        let (mut seq, mut rx) = sequencer(0);

        whole_fragment(&mut seq, 0, 1, 1).await;
        seq.complete_fragment(0, Some(0)).await;

        let (media, marks, _) = drain_media(&mut rx);
        assert_eq!(media, vec![vec![1, 0], vec![1, 1]]);
        assert_eq!(marks, 1);
    }

    #[tokio::test]
    async fn out_of_band_audio_bypasses_ordering() {
        let (mut seq, mut rx) = sequencer(0);

        whole_fragment(&mut seq, 0, 1, 1).await;
        seq.deliver_chunk(0, None, Bytes::from_static(b"notice")).await;
        seq.complete_fragment(0, None).await;

        let (media, marks, _) = drain_media(&mut rx);
        assert_eq!(media, vec![b"notice".to_vec()]);
        assert_eq!(marks, 1);
        assert_eq!(seq.expected_fragment(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_cuts_off_out_of_band_stream() {
        let (mut seq, mut rx) = sequencer(0);

        seq.deliver_chunk(0, None, Bytes::from_static(b"this call")).await;
        assert!(seq.barge_in().await);
        seq.deliver_chunk(0, None, Bytes::from_static(b"may be recorded")).await;
        seq.complete_fragment(0, None).await;

        let (media, marks, clears) = drain_media(&mut rx);
        assert_eq!(media, vec![b"this call".to_vec()]);
        assert_eq!(marks, 0);
        assert_eq!(clears, 1);
        assert!(!seq.is_speaking());

        // a later out-of-band fragment plays normally
        seq.deliver_chunk(0, None, Bytes::from_static(b"goodbye")).await;
        seq.complete_fragment(0, None).await;
        let (media, marks, _) = drain_media(&mut rx);
        assert_eq!(media, vec![b"goodbye".to_vec()]);
        assert_eq!(marks, 1);
    }

    #[tokio::test]
    async fn next_turn_waits_for_current_turn() {
        let (mut seq, mut rx) = sequencer(0);

        whole_fragment(&mut seq, 1, 0, 10).await;
        whole_fragment(&mut seq, 0, 0, 0).await;
        let (media, _, _) = drain_media(&mut rx);
        assert_eq!(media, vec![vec![0, 0], vec![0, 1]]);

        seq.finish_turn(1, 1).await;
        assert!(seq.take_delivered().is_empty());

        seq.finish_turn(0, 1).await;
        let (media, _, _) = drain_media(&mut rx);
        assert_eq!(media, vec![vec![10, 0], vec![10, 1]]);
        assert_eq!(seq.take_delivered(), vec![0, 1]);
        assert_eq!(seq.current_interaction(), 2);
    }

    // -- Marks and liveness ---------------------------------------------------

    #[tokio::test]
    async fn acknowledged_marks_end_speaking() {
        let (mut seq, mut rx) = sequencer(0);
        whole_fragment(&mut seq, 0, 0, 0).await;
        assert!(seq.is_speaking());

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OutboundEvent::Mark { mark, .. } = event {
                names.push(mark.name);
            }
        }
        assert_eq!(names.len(), 1);

        seq.mark_acked("unknown");
        assert!(seq.is_speaking());
        seq.mark_acked(&names[0]);
        assert!(!seq.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn speaking_resets_after_inactivity() {
        let (mut seq, _rx) = sequencer(0);
        seq.deliver_chunk(0, Some(0), Bytes::from_static(b"a")).await;
        assert!(seq.is_speaking());

        tokio::time::advance(Duration::from_millis(19_999)).await;
        assert!(seq.is_speaking());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!seq.is_speaking());
        assert_eq!(seq.outstanding_marks(), 0);
    }

    // -- Barge-in -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn barge_in_is_rate_limited() {
        let (mut seq, mut rx) = sequencer(0);
        seq.deliver_chunk(0, Some(0), Bytes::from_static(b"a")).await;

        assert!(seq.barge_in().await);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(!seq.barge_in().await);

        let (_, _, clears) = drain_media(&mut rx);
        assert_eq!(clears, 1);

        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(seq.barge_in().await);
    }

    #[tokio::test]
    async fn barge_in_resets_to_next_turn() {
        let (mut seq, mut rx) = sequencer(0);
        whole_fragment(&mut seq, 0, 0, 0).await;
        whole_fragment(&mut seq, 0, 2, 2).await;
        assert_eq!(seq.pending_len(), 1);

        assert!(seq.barge_in().await);
        assert_eq!(seq.current_interaction(), 1);
        assert_eq!(seq.expected_fragment(), 0);
        assert_eq!(seq.pending_len(), 0);
        assert!(!seq.is_speaking());

        // late audio for the interrupted turn is discarded
        whole_fragment(&mut seq, 0, 1, 1).await;
        seq.finish_turn(0, 3).await;
        let _ = drain_media(&mut rx);

        whole_fragment(&mut seq, 1, 0, 5).await;
        let (media, _, _) = drain_media(&mut rx);
        assert_eq!(media, vec![vec![5, 0], vec![5, 1]]);
        assert!(seq.take_delivered().is_empty());
    }

    #[tokio::test]
    async fn barge_in_after_rollover_keeps_next_turn() {
        let (mut seq, mut rx) = sequencer(0);
        whole_fragment(&mut seq, 0, 0, 0).await;
        seq.finish_turn(0, 1).await;
        assert_eq!(seq.current_interaction(), 1);

        // turn 1 audio arrives out of order before the caller interrupts turn 0
        whole_fragment(&mut seq, 1, 1, 7).await;
        assert!(seq.barge_in().await);
        assert_eq!(seq.current_interaction(), 1);
        assert_eq!(seq.pending_len(), 1);

        let _ = drain_media(&mut rx);
        whole_fragment(&mut seq, 1, 0, 6).await;
        let (media, _, _) = drain_media(&mut rx);
        assert_eq!(media, vec![vec![6, 0], vec![6, 1], vec![7, 0], vec![7, 1]]);
    }
}
