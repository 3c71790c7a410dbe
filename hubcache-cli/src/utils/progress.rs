use hubcache::DownloadEvent;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: true,
        }
    }

    pub fn handle_event(&self, event: &DownloadEvent) {
        if self.disabled {
            return;
        }

        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            DownloadEvent::CacheHit { .. } => {}
            DownloadEvent::Started {
                file,
                total,
                resumed_from,
            } => {
                let bar = self.multi.add(ProgressBar::new(total.unwrap_or(0)));
                bar.set_style(download_style());
                let verb = if *resumed_from > 0 { "Resuming" } else { "Downloading" };
                bar.set_message(format!("{verb} {file}"));
                bar.set_position(*resumed_from);
                bar.enable_steady_tick(Duration::from_millis(500));
                bars.insert(file.to_string(), bar);
            }
            DownloadEvent::Progress {
                file,
                received,
                total,
            } => {
                if let Some(bar) = bars.get(&file.to_string()) {
                    if let Some(total) = total {
                        bar.set_length(*total);
                    }
                    bar.set_position(*received);
                }
            }
            DownloadEvent::Finished { file, .. } => {
                if let Some(bar) = bars.remove(&file.to_string()) {
                    bar.finish_with_message(format!("Finished {file}"));
                }
            }
        }
    }
}
