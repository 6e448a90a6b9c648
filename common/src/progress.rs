use tracing::{event, instrument, Level};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks transfers in flight: started but not yet finished.
#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

#[derive(Debug)]
pub struct Progress {
    pub transfers: ProgressCounter,
    pub directories_scanned: TlsCounter,
    pub files_found: TlsCounter,
    pub bytes_copied: TlsCounter,
    pub files_transferred: TlsCounter,
    pub files_skipped: TlsCounter,
    pub files_failed: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            transfers: Default::default(),
            directories_scanned: Default::default(),
            files_found: Default::default(),
            bytes_copied: Default::default(),
            files_transferred: Default::default(),
            files_skipped: Default::default(),
            files_failed: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_files: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_files: progress.files_transferred.get(),
            last_bytes: progress.bytes_copied.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let transfers = self.progress.transfers.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64().max(f64::EPSILON);
        let files = self.progress.files_transferred.get();
        let average_files_rate = files as f64 / total_duration_secs;
        let current_files_rate = files.saturating_sub(self.last_files) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_copied.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        // update self
        self.last_files = files;
        self.last_bytes = bytes;
        self.last_update = time_now;
        Ok(format!(
            "---------------------\n\
            SCAN:\n\
            directories: {:>10}\n\
            files:       {:>10}\n\
            -----------------------\n\
            TRANSFERS:\n\
            in flight:   {:>10}\n\
            average:     {:>10.2} files/s\n\
            current:     {:>10.2} files/s\n\
            -----------------------\n\
            COPIED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            \n\
            transferred: {:>10}\n\
            skipped:     {:>10}\n\
            failed:      {:>10}",
            self.progress.directories_scanned.get(),
            self.progress.files_found.get(),
            transfers.started - transfers.finished,
            average_files_rate,
            current_files_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            files,
            self.progress.files_skipped.get(),
            self.progress.files_failed.get(),
        ))
    }
}
