#[cfg(test)]
mod unit_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;
    use tokio::time::Instant;

    use crate::channel::{ChannelHandle, Payload};
    use crate::config::TransferConfig;
    use crate::lifecycle::ConnectionState;
    use crate::memory::DetachedChannel;
    use crate::protocol::{classify, ControlMessage, FileHeader, Inbound};
    use crate::transfer::{FileSender, IncomingTransfer, ReceiveEvent};
    use crate::Error;

    fn sender(
        channel: &Arc<DetachedChannel>,
        config: TransferConfig,
    ) -> (FileSender, watch::Sender<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let handle: Arc<dyn ChannelHandle> = channel.clone();
        (FileSender::new(handle, state_rx, config), state_tx)
    }

    fn chunk_lengths(sent: &[Payload]) -> Vec<usize> {
        sent.iter()
            .filter_map(|p| match p {
                Payload::Binary(data) => Some(data.len()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sender_frames_header_chunks_end() {
        let channel = DetachedChannel::new("bob");
        let (mut tx, _state) = sender(&channel, TransferConfig::default());
        let data = vec![9u8; 40000];

        let mut progress = Vec::new();
        let report = tx
            .send(
                FileHeader::new("big.bin", 40000, "application/octet-stream"),
                &data[..],
                |p| progress.push(p.percent),
            )
            .await
            .unwrap();

        assert_eq!(report.bytes_sent, 40000);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.pauses, 0);
        assert_eq!(progress, vec![41, 82, 100]);

        let sent = channel.sent();
        assert_eq!(sent.len(), 5);
        assert!(matches!(
            classify(sent[0].clone()),
            Inbound::Control(ControlMessage::FileHeader(ref h)) if h.size == 40000
        ));
        assert_eq!(chunk_lengths(&sent), vec![16384, 16384, 7232]);
        assert_eq!(
            classify(sent[4].clone()),
            Inbound::Control(ControlMessage::FileEnd)
        );
    }

    #[tokio::test]
    async fn test_sender_zero_byte_file() {
        let channel = DetachedChannel::new("bob");
        let (mut tx, _state) = sender(&channel, TransferConfig::default());

        let mut calls = 0;
        let report = tx
            .send(FileHeader::new("empty", 0, "text/plain"), &b""[..], |_| calls += 1)
            .await
            .unwrap();

        assert_eq!(report.chunks, 0);
        assert_eq!(calls, 0);
        assert_eq!(channel.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_sender_requires_connection() {
        let channel = DetachedChannel::new("bob");
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let mut tx = FileSender::new(channel.clone(), state_rx, TransferConfig::default());

        let result = tx
            .send(FileHeader::new("a", 1, "text/plain"), &b"a"[..], |_| {})
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(channel.sent().is_empty());
        drop(state_tx);
    }

    #[tokio::test]
    async fn test_sender_short_source_still_ends_then_fails() {
        let channel = DetachedChannel::new("bob");
        let (mut tx, _state) = sender(&channel, TransferConfig::default());

        let result = tx
            .send(FileHeader::new("a", 10, "text/plain"), &b"abc"[..], |_| {})
            .await;
        assert!(matches!(result, Err(Error::TransferFailed(_))));

        let sent = channel.sent();
        assert_eq!(
            classify(sent.last().unwrap().clone()),
            Inbound::Control(ControlMessage::FileEnd)
        );
    }

    #[tokio::test]
    async fn test_sender_fails_when_channel_rejects() {
        let channel = DetachedChannel::new("bob");
        channel.close();
        let (mut tx, _state) = sender(&channel, TransferConfig::default());

        let result = tx
            .send(FileHeader::new("a", 1, "text/plain"), &b"a"[..], |_| {})
            .await;
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_pauses_until_drained() {
        let config = TransferConfig::default();
        let chunk = config.chunk_size;
        let channel = DetachedChannel::new("bob");
        // Ten chunks queued, draining one chunk per poll
        channel.set_buffered(10 * chunk, chunk);
        let (mut tx, _state) = sender(&channel, config.clone());

        let data = vec![1u8; 5 * chunk];
        let started = Instant::now();
        let report = tx
            .send(
                FileHeader::new("paced.bin", data.len() as u64, "application/octet-stream"),
                &data[..],
                |_| {},
            )
            .await
            .unwrap();

        assert!(report.pauses >= 1);
        assert_eq!(report.chunks, 5);
        assert_eq!(chunk_lengths(&channel.sent()), vec![chunk; 5]);
        // Drained from 10 chunks down to the 4 chunk threshold, one poll interval each
        assert!(started.elapsed() >= config.drain_poll * 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_gives_up_after_timeout() {
        let config = TransferConfig {
            drain_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let channel = DetachedChannel::new("bob");
        channel.set_buffered(usize::MAX / 2, 0);
        let (mut tx, _state) = sender(&channel, config.clone());

        let data = vec![1u8; 2 * config.chunk_size];
        let started = Instant::now();
        let report = tx
            .send(
                FileHeader::new("stuck.bin", data.len() as u64, "application/octet-stream"),
                &data[..],
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(report.pauses, 2);
        assert_eq!(report.chunks, 2);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_sender_during_drain() {
        let config = TransferConfig::default();
        let channel = DetachedChannel::new("bob");
        channel.set_buffered(usize::MAX / 2, 0);
        let (mut tx, state) = sender(&channel, config.clone());

        let data = vec![1u8; 3 * config.chunk_size];
        let task = tokio::spawn(async move {
            tx.send(
                FileHeader::new("doomed.bin", data.len() as u64, "application/octet-stream"),
                &data[..],
                |_| {},
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        state.send_replace(ConnectionState::Closed);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        // Only the header made it out
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_new_connection_does_not_revive_old_sender() {
        use tokio::io::AsyncWriteExt;

        let chunk = TransferConfig::default().chunk_size;
        let channel = DetachedChannel::new("bob");
        let (mut tx, state) = sender(&channel, TransferConfig::default());
        let (mut source, reader) = tokio::io::duplex(4 * chunk);

        let task = tokio::spawn(async move {
            tx.send(
                FileHeader::new("two.bin", 2 * chunk as u64, "application/octet-stream"),
                reader,
                |_| {},
            )
            .await
        });

        source.write_all(&vec![1u8; chunk]).await.unwrap();
        while channel.sent().len() < 2 {
            tokio::task::yield_now().await;
        }

        // The connection drops and a fresh one comes up before the next chunk is read
        state.send_replace(ConnectionState::Closed);
        state.send_replace(ConnectionState::Connected);
        source.write_all(&vec![2u8; chunk]).await.unwrap();
        drop(source);

        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(chunk_lengths(&channel.sent()), vec![chunk]);
    }

    #[tokio::test]
    async fn test_sender_output_reassembles_on_receiver() {
        let channel = DetachedChannel::new("bob");
        let config = TransferConfig {
            chunk_size: 1000,
            ..Default::default()
        };
        let (mut tx, _state) = sender(&channel, config);
        let data: Vec<u8> = (0..4567u32).map(|i| (i % 251) as u8).collect();

        tx.send(
            FileHeader::new("pattern.bin", data.len() as u64, "application/octet-stream"),
            &data[..],
            |_| {},
        )
        .await
        .unwrap();

        let mut rx = IncomingTransfer::new();
        let mut ready = None;
        for payload in channel.sent() {
            let events = match classify(payload) {
                Inbound::Control(ControlMessage::FileHeader(h)) => rx.on_header(h),
                Inbound::Control(ControlMessage::FileEnd) => rx.on_end(),
                Inbound::BinaryChunk(chunk) => rx.on_chunk(chunk),
                other => panic!("unexpected payload {:?}", other),
            };
            for event in events {
                if let ReceiveEvent::FileReady(file) = event {
                    ready = Some(file);
                }
            }
        }

        let file = ready.expect("file should be assembled");
        assert_eq!(file.name, "pattern.bin");
        assert_eq!(&file.data[..], &data[..]);
    }
}

#[cfg(test)]
mod integration_tests {
    use bytes::Bytes;
    use futures::FutureExt;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use crate::channel::{Channel, ChannelEvent, Payload, PeerSession};
    use crate::lifecycle::ConnectionState;
    use crate::memory::{MemoryNetwork, MemoryPeer};
    use crate::protocol::{encode_control, ControlMessage, FileHeader};
    use crate::session::{ChatOrigin, ChatSession, UiEvent};
    use crate::transfer::Diagnostic;
    use crate::{Error, TransferConfig};

    type Session = ChatSession<MemoryPeer>;

    fn join(network: &MemoryNetwork, id: &str) -> (Session, mpsc::UnboundedReceiver<UiEvent>) {
        let (peer, events) = network.join(id);
        ChatSession::new(peer, events, TransferConfig::default()).unwrap()
    }

    /// Handle every input that is ready right now
    fn drain<P: PeerSession>(session: &mut ChatSession<P>) -> usize {
        let mut handled = 0;
        while let Some(Some(input)) = session.next_input().now_or_never() {
            session.handle_input(input);
            handled += 1;
        }
        handled
    }

    fn pump(a: &mut Session, b: &mut Session) {
        while drain(a) + drain(b) > 0 {}
    }

    fn events(ui: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(event) = ui.try_recv() {
            out.push(event);
        }
        out
    }

    fn statuses(events: &[UiEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                UiEvent::Status { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn connected_pair() -> (
        MemoryNetwork,
        Session,
        mpsc::UnboundedReceiver<UiEvent>,
        Session,
        mpsc::UnboundedReceiver<UiEvent>,
    ) {
        let network = MemoryNetwork::new();
        let (mut a, mut a_ui) = join(&network, "alice");
        let (mut b, mut b_ui) = join(&network, "bob");

        a.connect("bob").unwrap();
        pump(&mut a, &mut b);

        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
        events(&mut a_ui);
        events(&mut b_ui);
        (network, a, a_ui, b, b_ui)
    }

    #[tokio::test]
    async fn test_connect_reaches_connected_on_both_sides() {
        let network = MemoryNetwork::new();
        let (mut a, mut a_ui) = join(&network, "alice");
        let (mut b, mut b_ui) = join(&network, "bob");

        a.connect("  bob ").unwrap();
        assert_eq!(a.state(), ConnectionState::Connecting);
        pump(&mut a, &mut b);

        assert_eq!(
            statuses(&events(&mut a_ui)),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        // The accepting side goes straight to connected
        assert_eq!(
            statuses(&events(&mut b_ui)),
            vec![ConnectionState::Connected]
        );
        assert_eq!(b.remote_id(), Some("alice"));
    }

    #[tokio::test]
    async fn test_self_and_empty_ids_are_rejected() {
        let network = MemoryNetwork::new();
        let (mut a, mut a_ui) = join(&network, "alice");

        assert!(matches!(a.connect("alice"), Err(Error::Validation(_))));
        assert!(matches!(a.connect(" alice "), Err(Error::Validation(_))));
        assert!(matches!(a.connect("   "), Err(Error::Validation(_))));
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert!(events(&mut a_ui).is_empty());
    }

    #[tokio::test]
    async fn test_chat_is_delivered_verbatim() {
        let (_net, mut a, mut a_ui, mut b, mut b_ui) = connected_pair();

        a.send_chat("hi").unwrap();
        a.send_chat(r#"{"hello":"world"}"#).unwrap();
        a.send_chat(r#"{"type":"unknown"}"#).unwrap();
        pump(&mut a, &mut b);

        assert_eq!(
            events(&mut a_ui)[0],
            UiEvent::Chat {
                text: "hi".into(),
                origin: ChatOrigin::Local
            }
        );
        assert_eq!(
            events(&mut b_ui),
            vec![
                UiEvent::Chat {
                    text: "hi".into(),
                    origin: ChatOrigin::Remote
                },
                UiEvent::Chat {
                    text: r#"{"hello":"world"}"#.into(),
                    origin: ChatOrigin::Remote
                },
                UiEvent::Chat {
                    text: r#"{"type":"unknown"}"#.into(),
                    origin: ChatOrigin::Remote
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_file_transfer_with_interleaved_chat() {
        let (_net, mut a, mut a_ui, mut b, mut b_ui) = connected_pair();
        let data = vec![0xabu8; 40000];

        a.send_chat("sending a file").unwrap();
        let report = a
            .upload()
            .unwrap()
            .run(
                FileHeader::new("photo.jpg", 40000, "image/jpeg"),
                &data[..],
            )
            .await
            .unwrap();
        a.send_chat("done").unwrap();
        assert_eq!(report.chunks, 3);
        pump(&mut a, &mut b);

        let sent_progress: Vec<u8> = events(&mut a_ui)
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::SendProgress(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(sent_progress, vec![41, 82, 100]);

        let received = events(&mut b_ui);
        let progress: Vec<u8> = received
            .iter()
            .filter_map(|e| match e {
                UiEvent::ReceiveProgress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![41, 82, 100]);

        let file = received
            .iter()
            .find_map(|e| match e {
                UiEvent::FileReady(file) => Some(file.clone()),
                _ => None,
            })
            .expect("file should be delivered");
        assert_eq!(file.name, "photo.jpg");
        assert_eq!(file.mime, "image/jpeg");
        assert_eq!(file.data.len(), 40000);

        let chats: Vec<&str> = received
            .iter()
            .filter_map(|e| match e {
                UiEvent::Chat { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chats, vec!["sending a file", "done"]);
        assert!(!b.incoming().is_active());
    }

    #[tokio::test]
    async fn test_remote_close_discards_incoming_transfer() {
        let (_net, mut a, mut a_ui, mut b, _b_ui) = connected_pair();

        b.send_chat("one moment").unwrap();
        pump(&mut a, &mut b);
        events(&mut a_ui);

        // Half a file arrives, then Bob hangs up
        inject_partial_transfer(&mut a);
        assert!(a.incoming().is_active());

        b.hangup();
        pump(&mut a, &mut b);

        let seen = events(&mut a_ui);
        assert_eq!(statuses(&seen), vec![ConnectionState::Closed]);
        assert!(seen.iter().any(|e| matches!(
            e,
            UiEvent::Diagnostic(Diagnostic::TransferDiscarded { received: 5, .. })
        )));
        assert_eq!(a.state(), ConnectionState::Closed);
        assert!(!a.incoming().is_active());
        assert!(a.send_chat("anyone?").is_err());
    }

    /// Feed a header and one chunk as if they came off the channel
    fn inject_partial_transfer(session: &mut Session) {
        let header = encode_control(&ControlMessage::FileHeader(FileHeader::new(
            "half.bin",
            10,
            "application/octet-stream",
        )))
        .unwrap();
        session.handle_channel_event(ChannelEvent::Data(header));
        session.handle_channel_event(ChannelEvent::Data(Payload::Binary(Bytes::from_static(
            b"12345",
        ))));
    }

    #[tokio::test]
    async fn test_hangup_is_idempotent() {
        let (_net, mut a, mut a_ui, mut b, mut b_ui) = connected_pair();

        a.hangup();
        assert_eq!(a.state(), ConnectionState::Closed);
        a.hangup();
        assert_eq!(a.state(), ConnectionState::Closed);
        pump(&mut a, &mut b);

        assert_eq!(statuses(&events(&mut a_ui)), vec![ConnectionState::Closed]);
        assert_eq!(statuses(&events(&mut b_ui)), vec![ConnectionState::Closed]);
        assert_eq!(b.state(), ConnectionState::Closed);

        // Hanging up with nothing connected is just as harmless
        let network = MemoryNetwork::new();
        let (mut idle, _ui) = join(&network, "idle");
        idle.hangup();
        idle.hangup();
        assert_eq!(idle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_orphan_chunk_is_dropped_not_assembled() {
        let (_net, mut a, mut a_ui, _b, _b_ui) = connected_pair();

        a.handle_channel_event(ChannelEvent::Data(Payload::Binary(Bytes::from_static(
            b"orphan",
        ))));
        inject_partial_transfer(&mut a);
        a.handle_channel_event(ChannelEvent::Data(Payload::Binary(Bytes::from_static(
            b"67890",
        ))));
        a.handle_channel_event(ChannelEvent::Data(
            encode_control(&ControlMessage::FileEnd).unwrap(),
        ));
        a.handle_channel_event(ChannelEvent::Data(
            encode_control(&ControlMessage::FileEnd).unwrap(),
        ));

        let seen = events(&mut a_ui);
        assert_eq!(
            seen[0],
            UiEvent::Diagnostic(Diagnostic::OrphanChunk { bytes: 6 })
        );
        let file = seen
            .iter()
            .find_map(|e| match e {
                UiEvent::FileReady(file) => Some(file.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(&file.data[..], b"1234567890");
        assert_eq!(
            seen.last(),
            Some(&UiEvent::Diagnostic(Diagnostic::OrphanEnd))
        );
        assert_eq!(a.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_structured_payloads() {
        let (_net, mut a, mut a_ui, _b, _b_ui) = connected_pair();

        a.handle_channel_event(ChannelEvent::Data(Payload::Structured(
            serde_json::json!({ "message": "from an old client" }),
        )));
        a.handle_channel_event(ChannelEvent::Data(Payload::Structured(
            serde_json::json!([1, 2, 3]),
        )));

        let seen = events(&mut a_ui);
        assert_eq!(
            seen[0],
            UiEvent::Chat {
                text: "from an old client".into(),
                origin: ChatOrigin::Remote
            }
        );
        assert!(matches!(
            seen[1],
            UiEvent::Diagnostic(Diagnostic::UnknownPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_errors_then_retry_connects() {
        let network = MemoryNetwork::new();
        let (mut a, mut a_ui) = join(&network, "alice");

        a.connect("bob").unwrap();
        while drain(&mut a) > 0 {}
        assert_eq!(a.state(), ConnectionState::Error);
        assert_eq!(
            statuses(&events(&mut a_ui)),
            vec![ConnectionState::Connecting, ConnectionState::Error]
        );

        // Never retried on its own
        assert_eq!(drain(&mut a), 0);
        assert_eq!(a.state(), ConnectionState::Error);

        let (mut b, _b_ui) = join(&network, "bob");
        a.retry().unwrap();
        pump(&mut a, &mut b);
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(a.remote_id(), Some("bob"));
    }

    #[tokio::test]
    async fn test_retry_without_history_is_rejected() {
        let network = MemoryNetwork::new();
        let (mut a, _ui) = join(&network, "alice");
        assert!(matches!(a.retry(), Err(Error::Validation(_))));

        a.hangup();
        assert!(a.retry().is_err());
        assert_eq!(a.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_incoming_refused_while_connected() {
        let (network, mut a, _a_ui, mut b, _b_ui) = connected_pair();
        let (mut c, mut c_ui) = join(&network, "carol");

        c.connect("alice").unwrap();
        pump(&mut a, &mut c);
        drain(&mut b);

        assert_eq!(a.remote_id(), Some("bob"));
        assert_eq!(c.state(), ConnectionState::Closed);
        assert_eq!(
            statuses(&events(&mut c_ui)),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_session_disconnect_reconnects_session_only() {
        let (network, mut a, mut a_ui, _b, _b_ui) = connected_pair();

        network.disconnect("alice");
        drain(&mut a);

        assert_eq!(a.peer().reconnects(), 1);
        assert_eq!(a.state(), ConnectionState::Connected);
        assert!(events(&mut a_ui)
            .iter()
            .any(|e| matches!(e, UiEvent::SessionNotice(_))));
    }

    #[tokio::test]
    async fn test_session_error_while_connecting() {
        let network = MemoryNetwork::new();
        let (mut a, mut a_ui) = join(&network, "alice");
        let (_b, _b_ui) = join(&network, "bob");

        a.connect("bob").unwrap();
        a.handle_session_event(crate::channel::SessionEvent::Error("signaling lost".into()));

        assert_eq!(a.state(), ConnectionState::Error);
        let seen = events(&mut a_ui);
        assert_eq!(
            seen.last(),
            Some(&UiEvent::Status {
                state: ConnectionState::Error,
                message: "signaling lost".into()
            })
        );
    }

    #[tokio::test]
    async fn test_close_tears_down_media() {
        use crate::media::{MediaCall, MediaStream, VideoTrack};
        use std::sync::Arc;

        struct NoopCall;
        impl MediaCall for NoopCall {
            fn replace_video_track(&self, _track: &VideoTrack) -> crate::Result<()> {
                Ok(())
            }
            fn close(&self) {}
        }

        let (_net, mut a, _a_ui, mut b, _b_ui) = connected_pair();
        a.media_mut().start_call(
            Arc::new(NoopCall),
            MediaStream {
                id: "local".into(),
                audio_enabled: true,
                video: Some(VideoTrack::camera("cam")),
            },
        );
        a.media_mut()
            .start_screen_share(VideoTrack::display("screen"))
            .unwrap();

        b.hangup();
        pump(&mut a, &mut b);

        assert!(!a.media().in_call());
        assert!(!a.media().is_sharing());
    }

    #[tokio::test]
    async fn test_only_one_upload_at_a_time() {
        let (_net, a, _a_ui, _b, _b_ui) = connected_pair();

        let first = a.upload().unwrap();
        assert!(a.is_uploading());
        assert!(matches!(a.upload(), Err(Error::TransferFailed(_))));

        first
            .run(FileHeader::new("a.txt", 3, "text/plain"), &b"abc"[..])
            .await
            .unwrap();
        assert!(!a.is_uploading());

        // An upload that is dropped without running frees the slot too
        drop(a.upload().unwrap());
        assert!(a.upload().is_ok());
    }

    #[tokio::test]
    async fn test_remote_close_cancels_running_upload() {
        let (_net, mut a, mut a_ui, mut b, mut b_ui) = connected_pair();
        let chunk = TransferConfig::default().chunk_size;
        let (mut source, reader) = tokio::io::duplex(4 * chunk);

        let upload = a.upload().unwrap();
        let sending = tokio::spawn(upload.run(
            FileHeader::new("movie.mp4", 3 * chunk as u64, "video/mp4"),
            reader,
        ));

        source.write_all(&vec![7u8; chunk]).await.unwrap();
        loop {
            match a_ui.recv().await {
                Some(UiEvent::SendProgress(_)) => break,
                Some(_) => {}
                None => panic!("ui stream ended"),
            }
        }
        pump(&mut a, &mut b);
        assert!(b.incoming().is_active());

        b.hangup();
        pump(&mut a, &mut b);
        assert_eq!(a.state(), ConnectionState::Closed);

        // The rest of the file shows up only after the connection is gone
        source.write_all(&vec![7u8; 2 * chunk]).await.unwrap();
        drop(source);

        assert!(matches!(sending.await.unwrap(), Err(Error::Cancelled)));
        assert!(!a.is_uploading());

        let received = events(&mut b_ui);
        let progress: Vec<u8> = received
            .iter()
            .filter_map(|e| match e {
                UiEvent::ReceiveProgress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![33]);
        assert!(received.iter().any(|e| matches!(
            e,
            UiEvent::Diagnostic(Diagnostic::TransferDiscarded { received: bytes, .. })
                if *bytes == chunk as u64
        )));
        assert!(!received.iter().any(|e| matches!(e, UiEvent::FileReady(_))));
    }

    /// A peer session that cannot make sense of any remote id
    struct TicketOnlyPeer;

    impl PeerSession for TicketOnlyPeer {
        fn local_id(&self) -> &str {
            "local-ticket"
        }

        fn open(&self, remote_id: &str) -> crate::Result<Channel> {
            Err(Error::InvalidTicket(format!("cannot parse {}", remote_id)))
        }

        fn reconnect(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unparsable_remote_id_is_a_validation_error() {
        let (_session_tx, session_rx) = mpsc::unbounded_channel();
        let (mut a, mut a_ui) =
            ChatSession::new(TicketOnlyPeer, session_rx, TransferConfig::default()).unwrap();

        assert!(matches!(a.connect("not-a-ticket"), Err(Error::Validation(_))));
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert!(events(&mut a_ui).is_empty());
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::lifecycle::ConnectionState;
    use crate::session::{ChatOrigin, ChatSession, UiEvent};
    use crate::{FileHeader, IrohPeer, TransferConfig};

    /// Chat and a file over real iroh endpoints
    #[tokio::test]
    #[ignore = "needs network access to reach the relay"]
    async fn test_chat_and_file_over_iroh() {
        let (alice_peer, alice_events) = IrohPeer::bind().await.unwrap();
        let (bob_peer, bob_events) = IrohPeer::bind().await.unwrap();
        let bob_ticket = bob_peer.ticket().to_string();

        let (mut alice, mut alice_ui) =
            ChatSession::new(alice_peer, alice_events, TransferConfig::default()).unwrap();
        let (mut bob, mut bob_ui) =
            ChatSession::new(bob_peer, bob_events, TransferConfig::default()).unwrap();

        alice.connect(&bob_ticket).unwrap();

        let connected = timeout(Duration::from_secs(30), async {
            while alice.state() != ConnectionState::Connected
                || bob.state() != ConnectionState::Connected
            {
                tokio::select! {
                    _ = alice.step() => {}
                    _ = bob.step() => {}
                }
            }
        })
        .await;
        assert!(connected.is_ok(), "should connect within timeout");

        alice.send_chat("hi").unwrap();
        let data = vec![3u8; 40000];
        let upload = alice.upload().unwrap();
        let send = tokio::spawn(async move {
            upload
                .run(FileHeader::new("data.bin", 40000, "application/octet-stream"), std::io::Cursor::new(data))
                .await
        });

        let result = timeout(Duration::from_secs(30), async {
            let mut chat = None;
            loop {
                tokio::select! {
                    _ = alice.step() => {}
                    _ = bob.step() => {}
                }
                while let Ok(event) = bob_ui.try_recv() {
                    match event {
                        UiEvent::Chat { text, origin } => chat = Some((text, origin)),
                        UiEvent::FileReady(file) => return (chat, file),
                        _ => {}
                    }
                }
                while alice_ui.try_recv().is_ok() {}
            }
        })
        .await
        .expect("transfer should finish within timeout");

        assert_eq!(result.0, Some(("hi".to_string(), ChatOrigin::Remote)));
        assert_eq!(result.1.data.len(), 40000);
        assert_eq!(send.await.unwrap().unwrap().bytes_sent, 40000);
    }
}
