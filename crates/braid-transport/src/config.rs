use std::time::Duration;

/// Configuration for an [`Endpoint`](crate::Endpoint) and the connections it
/// owns.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use braid_transport::EndpointConfig;
///
/// let config = EndpointConfig::new()
///     .queue_max_size(1000)
///     .retry_delay(std::time::Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum frame size accepted on the wire.
    pub(crate) max_frame_size: usize,
    /// How long a dial may take end to end, handshake included.
    pub(crate) handshake_timeout: Duration,
    /// Outbound queue capacity per connection; the oldest entry is dropped
    /// and failed when a send arrives on a full queue.
    pub(crate) queue_max_size: usize,
    /// Flush attempts per queued message before it is failed.
    pub(crate) max_send_tries: u32,
    /// Fixed delay between flush retries.
    pub(crate) retry_delay: Duration,
    /// Buffered-amount level at which a connection pauses draining.
    pub(crate) buffer_high: usize,
    /// Buffered-amount level below which the channel signals buffer-low.
    pub(crate) buffer_low: usize,
    /// Interval between pings.
    pub(crate) ping_interval: Duration,
    /// Unanswered pings tolerated before the connection is closed as dead.
    pub(crate) max_ping_pong_attempts: u32,
    /// Endpoint event channel capacity.
    pub(crate) event_buffer: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self {
            max_frame_size: crate::MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(15),
            queue_max_size: 500,
            max_send_tries: 10,
            retry_delay: Duration::from_millis(100),
            buffer_high: 1 << 17,
            buffer_low: 1 << 15,
            ping_interval: Duration::from_secs(2),
            max_ping_pong_attempts: 5,
            event_buffer: 256,
        }
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn queue_max_size(mut self, size: usize) -> Self {
        self.queue_max_size = size;
        self
    }

    pub fn max_send_tries(mut self, tries: u32) -> Self {
        self.max_send_tries = tries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn buffer_watermarks(mut self, high: usize, low: usize) -> Self {
        self.buffer_high = high;
        self.buffer_low = low;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn max_ping_pong_attempts(mut self, attempts: u32) -> Self {
        self.max_ping_pong_attempts = attempts;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// The subset a channel implementation needs.
    pub fn channel_tuning(&self) -> ChannelTuning {
        ChannelTuning {
            max_frame_size: self.max_frame_size,
            buffer_low: self.buffer_low,
        }
    }
}

/// Tuning handed to channel factories and listeners: the frame-size guard for
/// reads and the low watermark at which the channel emits buffer-low.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTuning {
    pub max_frame_size: usize,
    pub buffer_low: usize,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        EndpointConfig::new().channel_tuning()
    }
}
