// SPDX-License-Identifier: GPL-3.0-or-later
mod download_cleaner;
mod queue_cleaner;

#[cfg(test)]
mod testing;

pub use download_cleaner::DownloadCleanerJob;
pub use queue_cleaner::QueueCleanerJob;
