//! File materialization ahead of a provider call
//!
//! Files are grouped into those the provider needs as bytes and those it can
//! take as links; links beyond the provider's URL budget spill into the
//! download set. Downloads run concurrently and failures aggregate into one
//! `invalid_file` error.

use std::time::Instant;

use tokio::task::JoinSet;

use crate::domain::file::File;
use crate::domain::message::Message;
use crate::error::{ApiError, ErrorCode};
use crate::providers::Provider;

const DOWNLOAD_RETRIES: u32 = 2;

pub struct FileHandler<'a> {
    provider: &'a dyn Provider,
    model: &'a str,
    client: &'a reqwest::Client,
}

impl<'a> FileHandler<'a> {
    pub fn new(provider: &'a dyn Provider, model: &'a str, client: &'a reqwest::Client) -> Self {
        Self {
            provider,
            model,
            client,
        }
    }

    fn should_download(&self, file: &File) -> bool {
        if file.data.is_some() {
            return false;
        }
        self.provider.requires_downloading_file(file, self.model)
    }

    /// Partition file slots into the set that must be downloaded
    fn slots_to_download(&self, files: &[(usize, usize, File)]) -> Vec<(usize, usize)> {
        let mut to_download = Vec::new();
        let mut as_links = Vec::new();
        for (message_idx, part_idx, file) in files {
            if self.should_download(file) {
                to_download.push((*message_idx, *part_idx));
            } else if file.data.is_none() {
                as_links.push((*message_idx, *part_idx));
            }
        }
        // Links beyond the provider's URL budget spill into downloads
        if let Some(max_urls) = self.provider.max_number_of_file_urls() {
            if as_links.len() > max_urls {
                to_download.extend(as_links.split_off(max_urls));
            }
        }
        to_download
    }

    /// Sanitize every file, then materialize the ones the provider needs as
    /// bytes. Data is written back into the messages so downstream storage
    /// never re-downloads.
    pub async fn handle_files_in_messages(
        &self,
        messages: &mut [Message],
    ) -> Result<(), ApiError> {
        let mut files = Vec::new();
        for (message_idx, message) in messages.iter_mut().enumerate() {
            for (part_idx, content) in message.content.iter_mut().enumerate() {
                if let Some(file) = content.file.as_mut() {
                    file.sanitize()?;
                    files.push((message_idx, part_idx, file.clone()));
                }
            }
        }
        if files.is_empty() {
            return Ok(());
        }

        let to_download = self.slots_to_download(&files);
        if to_download.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut tasks: JoinSet<(usize, usize, Result<File, ApiError>)> = JoinSet::new();
        for (message_idx, part_idx) in to_download {
            let mut file = messages[message_idx].content[part_idx]
                .file
                .clone()
                .expect("slot was collected as a file");
            let client = self.client.clone();
            tasks.spawn(async move {
                let result = file.download(&client, DOWNLOAD_RETRIES).await.map(|_| file);
                (message_idx, part_idx, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((message_idx, part_idx, Ok(file))) => {
                    messages[message_idx].content[part_idx].file = Some(file);
                }
                Ok((_, _, Err(e))) => failures.push(e.message),
                Err(e) => failures.push(format!("download task failed: {e}")),
            }
        }

        crate::metrics::FILE_DOWNLOAD_SECONDS
            .with_label_values(&[self.provider.id().as_str()])
            .observe(started.elapsed().as_secs_f64());

        if !failures.is_empty() {
            return Err(ApiError::new(
                ErrorCode::InvalidFile,
                format!("Failed to download {} files: {}", failures.len(), failures.join("; ")),
            ));
        }
        Ok(())
    }
}
