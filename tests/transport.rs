mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use telemux::error::Error;
    use telemux::record::{Record, Registry, Template};
    use telemux::transport::{
        DataFormat, ReceiverConfig, RecvTimeout, SenderConfig, StreamReceiver, StreamSender,
    };

    pub fn init() {
        env_logger::builder().is_test(true).try_init().ok();
    }

    fn unique_unix_id(tag: &str) -> String {
        use rand::RngCore;
        format!("test-{}-{}-{}", tag, std::process::id(), rand::thread_rng().next_u32())
    }

    fn flow_registry() -> Registry {
        let mut reg = Registry::new();
        reg.define_set("uint32 A,uint32 B,uint64 C,string S,time TS")
            .unwrap();
        reg
    }

    fn recv_with_deadline<'a>(
        receiver: &'a mut StreamReceiver,
        budget: Duration,
    ) -> Result<&'a [u8], Error> {
        receiver.recv(RecvTimeout::Micros(budget.as_micros() as u64))
    }

    /// Scenario: one producer, one consumer, three records in one container.
    #[test]
    pub fn single_consumer_three_records() {
        init();
        let reg = flow_registry();
        let tpl = Template::from_spec(&reg, "uint32 A,string S").unwrap();
        let a = reg.lookup("A").unwrap();
        let s = reg.lookup("S").unwrap();

        let sender = StreamSender::with_format(
            SenderConfig::tcp(0),
            DataFormat::Schema(tpl.to_spec_string(',')),
        )
        .unwrap();
        let port = sender.local_addr().unwrap().port();

        for (value, text) in [(1u32, "x"), (2, "yy"), (3, "zzz")] {
            let mut rec = Record::new(&tpl, 16);
            rec.set(&tpl, a, value).unwrap();
            rec.set_var(&tpl, s, text.as_bytes()).unwrap();
            sender.send(rec.as_bytes(&tpl)).unwrap();
        }
        sender.flush().unwrap();

        let mut receiver = StreamReceiver::new(
            ReceiverConfig::tcp("127.0.0.1", port),
            DataFormat::Schema(tpl.to_spec_string(',')),
        );
        for (value, text) in [(1u32, "x"), (2, "yy"), (3, "zzz")] {
            let bytes = recv_with_deadline(&mut receiver, Duration::from_secs(5))
                .unwrap()
                .to_vec();
            let rec = Record::from_bytes(&tpl, &bytes).unwrap();
            assert_eq!(rec.get::<u32>(&tpl, a).unwrap(), value);
            assert_eq!(rec.var(&tpl, s).unwrap(), text.as_bytes());
        }

        let stats = receiver.stats();
        assert_eq!(stats.received_records, 3);
        assert_eq!(stats.received_containers, 1);
        assert_eq!(stats.missed_records, 0);
        assert_eq!(sender.processed_records(), 3);
    }

    /// Boundary: a record of exactly the container capacity fits; a full
    /// active container rotates before the next insert; an oversized record
    /// is dropped without failing the call.
    #[test]
    pub fn container_capacity_boundaries() {
        init();
        let sender = StreamSender::with_format(
            SenderConfig {
                buffer_size: 64,
                autoflush: Duration::from_secs(3600),
                ..SenderConfig::tcp(0)
            },
            DataFormat::Raw,
        )
        .unwrap();

        // capacity - header - length prefix = 64 - 14 - 2
        let exact = vec![0xAB; 48];
        sender.send(&exact).unwrap();
        assert_eq!(sender.processed_records(), 1);
        assert_eq!(sender.finished_containers(), 0);

        // the active container is full, the next record rotates it
        sender.send(&[1, 2, 3]).unwrap();
        assert_eq!(sender.finished_containers(), 1);
        assert_eq!(sender.processed_records(), 2);

        // one byte over the capacity is fail-dropped
        let oversize = vec![0xCD; 49];
        sender.send(&oversize).unwrap();
        assert_eq!(sender.processed_records(), 2);
    }

    /// Scenario: ring overflow in blocking mode. With nobody consuming, the
    /// producer blocks on the publication that would overwrite an unseen
    /// container; a consumer draining the ring unblocks it.
    #[test]
    pub fn blocking_publish_waits_for_consumer() {
        init();
        let id = unique_unix_id("blocking");
        let sender = Arc::new(
            StreamSender::with_format(
                SenderConfig {
                    buffer_size: 64,
                    active_containers: 2,
                    blocking: true,
                    autoflush: Duration::from_secs(3600),
                    ..SenderConfig::unix(&id)
                },
                DataFormat::Raw,
            )
            .unwrap(),
        );

        let producer_sender = sender.clone();
        let sent = Arc::new(AtomicU64::new(0));
        let producer_sent = sent.clone();
        let producer = std::thread::spawn(move || {
            for i in 0..4u8 {
                // each record fills one container
                producer_sender.send(&vec![i; 48]).unwrap();
                producer_sent.fetch_add(1, Ordering::SeqCst);
            }
        });

        // the third send publishes into a full ring and must block
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert!(!producer.is_finished());

        // a consumer draining containers advances the lowest cursor
        let mut receiver =
            StreamReceiver::new(ReceiverConfig::unix(&id), DataFormat::Raw);
        let mut drained = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while drained < 3 && Instant::now() < deadline {
            if recv_with_deadline(&mut receiver, Duration::from_millis(500)).is_ok() {
                drained += 1;
            }
        }
        assert_eq!(drained, 3);
        producer.join().unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 4);

        // the remaining records arrive after a flush
        sender.flush().unwrap();
        let mut total = drained;
        let deadline = Instant::now() + Duration::from_secs(10);
        while total < 4 && Instant::now() < deadline {
            if recv_with_deadline(&mut receiver, Duration::from_millis(500)).is_ok() {
                total += 1;
            }
        }
        assert_eq!(total, 4);
        assert_eq!(receiver.stats().missed_records, 0);
    }

    /// Scenario: a lagging consumer in non-blocking mode skips to the ring
    /// head; the dropped range shows up in its sequence-gap accounting.
    #[test]
    pub fn non_blocking_laggard_drops_containers() {
        init();
        let id = unique_unix_id("laggard");
        let sender = StreamSender::with_format(
            SenderConfig {
                buffer_size: 8192,
                active_containers: 2,
                autoflush: Duration::from_secs(3600),
                ..SenderConfig::unix(&id)
            },
            DataFormat::Raw,
        )
        .unwrap();

        let mut receiver = StreamReceiver::new(ReceiverConfig::unix(&id), DataFormat::Raw);
        // connect and read one record, then pause while the producer floods
        let payload = vec![0x5A; 8000];
        sender.send(&payload).unwrap();
        sender.flush().unwrap();
        recv_with_deadline(&mut receiver, Duration::from_secs(5)).unwrap();

        // each record fills one container; far more data than the socket
        // buffers can hold, so the paused consumer's ring cursor lags and
        // containers get recycled under it
        const TOTAL: u64 = 600;
        for _ in 1..TOTAL {
            sender.send(&payload).unwrap();
        }
        sender.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            match recv_with_deadline(&mut receiver, Duration::from_millis(500)) {
                Ok(_) => {}
                Err(Error::Timeout) => {
                    if receiver.stats().received_records + receiver.stats().missed_records
                        >= TOTAL
                    {
                        break;
                    }
                }
                Err(e) => panic!("unexpected receive error: {:?}", e),
            }
        }

        let stats = receiver.stats();
        assert!(
            stats.missed_records > 0,
            "paused consumer should have dropped containers, stats {:?}",
            stats
        );
        assert!(
            stats.received_records + stats.missed_records >= TOTAL,
            "every record is either received or accounted as missed, stats {:?}",
            stats
        );
    }

    /// Scenario: receiver-subset negotiation. The receiver requires fewer
    /// fields than offered, reads records in the sender's layout and
    /// ignores the extras.
    #[test]
    pub fn negotiation_receiver_subset() {
        init();
        let reg = flow_registry();
        let sender_tpl = Template::from_spec(&reg, "uint32 A,uint32 B,string S").unwrap();
        let a = reg.lookup("A").unwrap();
        let b = reg.lookup("B").unwrap();
        let s = reg.lookup("S").unwrap();

        let sender = StreamSender::with_format(
            SenderConfig::tcp(0),
            DataFormat::Schema(sender_tpl.to_spec_string(',')),
        )
        .unwrap();
        let port = sender.local_addr().unwrap().port();

        let mut rec = Record::new(&sender_tpl, 16);
        rec.set(&sender_tpl, a, 7u32).unwrap();
        rec.set(&sender_tpl, b, 8u32).unwrap();
        rec.set_var(&sender_tpl, s, b"keep").unwrap();
        sender.send(rec.as_bytes(&sender_tpl)).unwrap();
        sender.flush().unwrap();

        let mut receiver = StreamReceiver::new(
            ReceiverConfig::tcp("127.0.0.1", port),
            DataFormat::Schema("uint32 A,string S".to_owned()),
        );
        let bytes = recv_with_deadline(&mut receiver, Duration::from_secs(5))
            .unwrap()
            .to_vec();

        // records arrive in the sender's layout; parse with the negotiated
        // spec and pick the required fields
        let negotiated = receiver.negotiated_spec().unwrap().to_owned();
        let wire_tpl = Template::from_spec(&reg, &negotiated).unwrap();
        assert_eq!(wire_tpl, sender_tpl);
        let rec = Record::from_bytes(&wire_tpl, &bytes).unwrap();
        assert_eq!(rec.get::<u32>(&wire_tpl, a).unwrap(), 7);
        assert_eq!(rec.var(&wire_tpl, s).unwrap(), b"keep");
    }

    /// Scenario: negotiation mismatch. The same field with a different type
    /// refuses the connection.
    #[test]
    pub fn negotiation_mismatch_closes() {
        init();
        let sender = StreamSender::with_format(
            SenderConfig::tcp(0),
            DataFormat::Schema("uint32 A".to_owned()),
        )
        .unwrap();
        let port = sender.local_addr().unwrap().port();

        let mut receiver = StreamReceiver::new(
            ReceiverConfig::tcp("127.0.0.1", port),
            DataFormat::Schema("uint64 A".to_owned()),
        );
        match recv_with_deadline(&mut receiver, Duration::from_secs(5)) {
            Err(Error::FormatMismatch) => {}
            other => panic!("expected FormatMismatch, got {:?}", other),
        }
        // reconnecting renegotiates and fails the same way
        match recv_with_deadline(&mut receiver, Duration::from_secs(5)) {
            Err(Error::FormatMismatch) => {}
            other => panic!("expected FormatMismatch, got {:?}", other),
        }
        drop(sender);
    }

    /// Scenario: the sender's format changes between connections; the
    /// receiver gets the signal at a record boundary, expands its template
    /// and keeps receiving.
    #[test]
    pub fn format_change_is_surfaced_and_recovered() {
        init();
        let mut reg = flow_registry();
        let id = unique_unix_id("fmtchange");
        let a = reg.lookup("A").unwrap();

        let first = StreamSender::with_format(
            SenderConfig::unix(&id),
            DataFormat::Schema("uint32 A".to_owned()),
        )
        .unwrap();
        let tpl_v1 = Template::from_spec(&reg, "uint32 A").unwrap();
        let mut rec = Record::new(&tpl_v1, 0);
        rec.set(&tpl_v1, a, 1u32).unwrap();
        first.send(rec.as_bytes(&tpl_v1)).unwrap();
        first.flush().unwrap();

        let mut receiver = StreamReceiver::new(
            ReceiverConfig::unix(&id),
            DataFormat::Schema("uint32 A".to_owned()),
        );
        let bytes = recv_with_deadline(&mut receiver, Duration::from_secs(5))
            .unwrap()
            .to_vec();
        let rec = Record::from_bytes(&tpl_v1, &bytes).unwrap();
        assert_eq!(rec.get::<u32>(&tpl_v1, a).unwrap(), 1);

        // replace the endpoint with one offering additional fields
        drop(first);
        let second = StreamSender::with_format(
            SenderConfig::unix(&id),
            DataFormat::Schema("uint32 A,double RTT".to_owned()),
        )
        .unwrap();

        let mut tpl = tpl_v1;
        let mut got_value = None;
        let deadline = Instant::now() + Duration::from_secs(15);
        while got_value.is_none() && Instant::now() < deadline {
            match recv_with_deadline(&mut receiver, Duration::from_secs(1)) {
                Ok(bytes) => {
                    let bytes = bytes.to_vec();
                    let rec = Record::from_bytes(&tpl, &bytes).unwrap();
                    got_value = Some(rec.get::<u32>(&tpl, a).unwrap());
                }
                Err(Error::FormatChanged(spec)) => {
                    // register the new fields and reinstall the template
                    tpl = tpl.define_and_expand(&mut reg, &spec).unwrap();
                    receiver.install_format(DataFormat::Schema(tpl.to_spec_string(',')));

                    let rtt = reg.lookup("RTT").unwrap();
                    let mut rec = Record::new(&tpl, 0);
                    rec.set(&tpl, a, 2u32).unwrap();
                    rec.set(&tpl, rtt, 0.25f64).unwrap();
                    second.send(rec.as_bytes(&tpl)).unwrap();
                    second.flush().unwrap();
                }
                Err(Error::Timeout) => {}
                Err(e) => panic!("unexpected receive error: {:?}", e),
            }
        }
        assert_eq!(got_value, Some(2));
        assert!(reg.lookup("RTT").is_some());
    }

    /// Scenario: auto-flush. A single record in a non-full container
    /// reaches the consumer within two flush periods.
    #[test]
    pub fn autoflush_delivers_partial_container() {
        init();
        let sender = StreamSender::with_format(
            SenderConfig {
                autoflush: Duration::from_millis(100),
                ..SenderConfig::tcp(0)
            },
            DataFormat::Raw,
        )
        .unwrap();
        let port = sender.local_addr().unwrap().port();

        let mut receiver =
            StreamReceiver::new(ReceiverConfig::tcp("127.0.0.1", port), DataFormat::Raw);
        // connect first so the consumer's cursor covers the container
        match recv_with_deadline(&mut receiver, Duration::from_millis(200)) {
            Err(Error::Timeout) => {}
            other => panic!("expected idle timeout, got {:?}", other),
        }

        sender.send(b"lonely record").unwrap();
        let started = Instant::now();
        let bytes = recv_with_deadline(&mut receiver, Duration::from_millis(2_000)).unwrap();
        assert_eq!(bytes, b"lonely record");
        assert!(started.elapsed() < Duration::from_millis(2_000));
    }

    /// Termination makes in-flight and subsequent sends fail, and Drop
    /// tears the endpoint down without hanging.
    #[test]
    pub fn terminate_stops_send() {
        init();
        let sender =
            StreamSender::with_format(SenderConfig::tcp(0), DataFormat::Raw).unwrap();
        sender.send(b"one").unwrap();
        sender.terminate();
        match sender.send(b"two") {
            Err(Error::Terminated) => {}
            other => panic!("expected Terminated, got {:?}", other),
        }
    }

    /// Consumers beyond max_clients are refused, the endpoint keeps serving
    /// the admitted ones.
    #[test]
    pub fn max_clients_is_enforced() {
        init();
        let sender = StreamSender::with_format(
            SenderConfig {
                max_clients: 1,
                ..SenderConfig::tcp(0)
            },
            DataFormat::Raw,
        )
        .unwrap();
        let port = sender.local_addr().unwrap().port();

        let mut first =
            StreamReceiver::new(ReceiverConfig::tcp("127.0.0.1", port), DataFormat::Raw);
        match recv_with_deadline(&mut first, Duration::from_millis(300)) {
            Err(Error::Timeout) => {}
            other => panic!("expected idle timeout, got {:?}", other),
        }
        assert_eq!(sender.connected_clients(), 1);

        // the second consumer is shut down before any hello
        let mut second =
            StreamReceiver::new(ReceiverConfig::tcp("127.0.0.1", port), DataFormat::Raw);
        let result = recv_with_deadline(&mut second, Duration::from_millis(300));
        assert!(result.is_err());
        assert_eq!(sender.connected_clients(), 1);

        sender.send(b"still flowing").unwrap();
        sender.flush().unwrap();
        let bytes = recv_with_deadline(&mut first, Duration::from_secs(5)).unwrap();
        assert_eq!(bytes, b"still flowing");
    }
}
