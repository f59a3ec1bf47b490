enum Received {
    Done(bool),
    /// Local content appeared after discovery; it must be uploaded instead.
    Redirect,
}

impl SyncEngine {
    fn client(&self, record: &FileRecord) -> Result<&RecordClient, EngineError> {
        let root = &record.coordinate().root;
        self.client_for(root)
            .ok_or_else(|| EngineError::NoClient(root.clone()))
    }

    /// Remote to local. Counts as one in-flight transfer for its whole duration,
    /// including an upload it turns into.
    pub(crate) async fn receive(&self, record: &FileRecord) -> bool {
        self.enter_queue();
        let ok = match self.receive_inner(record).await {
            Received::Done(ok) => ok,
            Received::Redirect => {
                info!(file = %record.key(), "file has local content; uploading instead");
                self.send(record).await
            }
        };
        self.leave_queue(ok);
        ok
    }

    async fn receive_inner(&self, record: &FileRecord) -> Received {
        let coordinate = record.coordinate();
        let context = NotifyContext::from(coordinate);
        let query = coordinate.query();
        debug!(
            file = %record.key(),
            table = %coordinate.table,
            field = %coordinate.field,
            "downloading"
        );

        let remote = match self.fetch_field(record).await {
            Ok(remote) => remote,
            Err(err) => {
                self.fail(record, &err, &context);
                return Received::Done(false);
            }
        };
        if remote.content.is_empty() {
            warn!(file = %record.key(), "record field is empty");
        }

        match self.guarded_write(record, remote.content.as_bytes()).await {
            Ok(false) => return Received::Redirect,
            Ok(true) => {}
            Err(err) => {
                error!(file = %record.key(), error = %err, "failed to write file");
                self.notify(NotifyCode::ReceivedFileError, &context);
                return Received::Done(false);
            }
        }

        if let Err(err) = record
            .save_fingerprint(remote.content.as_bytes(), remote.sys_id.as_deref())
            .await
        {
            self.fail(record, &EngineError::from(err), &context);
            return Received::Done(false);
        }

        info!(file = %record.key(), table = %coordinate.table, %query, "received");
        let code = if remote.content.is_empty() {
            NotifyCode::ReceivedEmpty
        } else {
            NotifyCode::ReceivedFile
        };
        self.notify(code, &context);
        Received::Done(true)
    }

    /// Writes `data` unless the file was newly discovered and meanwhile got content.
    /// Consumes the newly-discovered flag. Returns whether the file was written.
    pub(crate) async fn guarded_write(
        &self,
        record: &FileRecord,
        data: &[u8],
    ) -> Result<bool, EngineError> {
        if record.take_newly_discovered() {
            match tokio::fs::read(record.path()).await {
                Ok(existing) if !existing.is_empty() => return Ok(false),
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(EngineError::Io {
                        path: record.path().to_path_buf(),
                        source,
                    });
                }
            }
        }
        self.write_file(record.path(), data).await?;
        Ok(true)
    }

    /// Local to remote, guarded by the three-way check.
    pub(crate) async fn send(&self, record: &FileRecord) -> bool {
        let coordinate = record.coordinate();
        let context = NotifyContext::from(coordinate);

        let content = match self.read_text(record.path()).await {
            Ok(content) => content,
            Err(err) => {
                self.fail(record, &err, &context);
                return false;
            }
        };

        let decision = match self.check_in_sync(record, content.as_bytes()).await {
            Ok(decision) => decision,
            Err(err) => {
                self.fail(record, &err, &context);
                return false;
            }
        };
        if !decision.in_sync() {
            warn!(file = %record.key(), "remote changed since last sync; not uploading");
            self.notify(NotifyCode::NotInSync, &context);
            return false;
        }
        if decision.no_push_needed() {
            info!(file = %record.key(), ?decision, "no changes to push");
            return true;
        }

        let result = match self.client(record) {
            Ok(client) => {
                client
                    .update_field(
                        &coordinate.table,
                        &coordinate.query(),
                        &coordinate.field,
                        &content,
                    )
                    .await
                    .map_err(EngineError::from)
            }
            Err(err) => Err(err),
        };
        let updated = match result {
            Ok(updated) => updated,
            Err(err) => {
                if err.is_sticky() {
                    record.record_error(err.to_string());
                }
                error!(file = %record.key(), error = %err, "upload failed");
                self.notify(NotifyCode::UploadError, &context);
                return false;
            }
        };

        let sys_id = updated.first().and_then(|remote| remote.sys_id());
        if let Err(err) = record.save_fingerprint(content.as_bytes(), sys_id).await {
            self.fail(record, &EngineError::from(err), &context);
            return false;
        }
        info!(file = %record.key(), table = %coordinate.table, "updated instance version");
        self.notify(NotifyCode::UploadComplete, &context);
        true
    }

    /// Three-way comparison of the stored, local and remote fingerprints. The local
    /// comparison runs first and needs no request.
    pub(crate) async fn check_in_sync(
        &self,
        record: &FileRecord,
        content: &[u8],
    ) -> Result<SyncDecision, EngineError> {
        let local = fingerprint(content);
        let stored = record.get_fingerprint().await;
        if let Some(decision) = check_local(&stored, &local) {
            return Ok(decision);
        }

        debug!(file = %record.key(), "comparing remote version with last synced version");
        let remote = self.fetch_field(record).await?;
        let decision = check_remote(&stored, &local, &fingerprint(remote.content.as_bytes()));
        if decision == SyncDecision::Converged {
            record
                .save_fingerprint(content, remote.sys_id.as_deref())
                .await?;
        }
        Ok(decision)
    }

    /// Record fields hold text, so only valid UTF-8 is uploaded; the fingerprint is
    /// taken over the same bytes the server receives.
    async fn read_text(&self, path: &Path) -> Result<String, EngineError> {
        let content = self.read_file(path).await?;
        String::from_utf8(content).map_err(|_| EngineError::NotText(path.to_path_buf()))
    }

    async fn fetch_field(&self, record: &FileRecord) -> Result<RemoteField, EngineError> {
        let coordinate = record.coordinate();
        let query = coordinate.query();
        let list = self
            .client(record)?
            .get_records(&coordinate.table, &query)
            .await?;
        let remote = list.first().ok_or_else(|| EngineError::RecordNotFound {
            table: coordinate.table.clone(),
            query,
        })?;
        let content = remote
            .field(&coordinate.field)
            .ok_or_else(|| EngineError::MissingField(coordinate.field.clone()))?;
        Ok(RemoteField {
            content: content.to_string(),
            sys_id: remote.sys_id().map(str::to_string),
        })
    }
}

struct RemoteField {
    content: String,
    sys_id: Option<String>,
}
