//! Kill/reconnect scenario driven through recording fakes

use std::sync::Arc;
use std::time::Duration;

use vt_scenarios::guest::TestEnv;
use vt_scenarios::scenarios::block_reconnect::NetworkBlock;
use vt_scenarios::scenarios::{ScenarioContext, ScenarioKind};
use vt_scenarios::testing::fakes::{Event, FakeClock, FakeHost, FakeVm, GuestReply, Journal};
use vt_scenarios::{Error, Params, Result};

const LISTING: &str = "root     41230     1  0 10:02 ?        00:00:00 qemu-nbd -p 10809 -e /data.img\n";
const RESTART: &str = "qemu-nbd -p 10809 -e /data.img";
const BLOCK: &str = "iptables -I INPUT -p tcp --dport 10809 -j REJECT";
const UNBLOCK: &str = "iptables -D INPUT -p tcp --dport 10809 -j REJECT";

struct Harness {
    journal: Journal,
    host: FakeHost,
    clock: FakeClock,
    vm: Arc<FakeVm>,
    env: TestEnv,
}

impl Harness {
    fn new() -> Self {
        let journal = Journal::new();
        let host = FakeHost::new(journal.clone());
        host.stdout("ps -ef", LISTING);

        let vm = Arc::new(FakeVm::new("vm1", journal.clone()));
        vm.output("findmnt", "vda\n").output("grep -v vda", "vdb\n");

        let mut env = TestEnv::new();
        env.insert(vm.clone());

        Self {
            clock: FakeClock::new(journal.clone()),
            journal,
            host,
            vm,
            env,
        }
    }

    async fn run(&self, params: Params) -> Result<()> {
        let mut ctx = ScenarioContext::new(params, &self.env, &self.host, &self.clock);
        ScenarioKind::BlockKillReconnect.run(&mut ctx).await
    }

    fn io_on(&self, disk: &str) -> usize {
        let target = format!("of=/dev/{} ", disk);
        self.journal
            .count(|e| matches!(e, Event::Guest { command, .. } if command.contains(&target)))
    }

    fn host_count(&self, command: &str) -> usize {
        self.journal
            .count(|e| matches!(e, Event::Host(c) if c == command))
    }

    fn sleeps(&self) -> Vec<Duration> {
        self.journal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sleep(d) => Some(d),
                _ => None,
            })
            .collect()
    }
}

fn params(repeat_times: u32) -> Params {
    let repeat = repeat_times.to_string();
    [
        ("main_vm", "vm1"),
        ("find_system_disk_cmd", "lsblk -no pkname $(findmnt -no source /)"),
        ("find_data_disk_cmd", "lsblk -dno name | grep -v %s | head -1"),
        ("disk_op_cmd", "dd if=/dev/zero of=/dev/%s bs=1M count=10 oflag=direct"),
        ("save_export_data_img_cmd", "ps -ef | grep 'qemu-nbd -p %s' | grep -v grep"),
        ("find_data_disk_pid_cmd", "fuser -k %s/tcp"),
        ("net_break_cmd", "iptables -I INPUT -p tcp --dport %s -j REJECT"),
        ("net_resume_cmd", "iptables -D INPUT -p tcp --dport %s -j REJECT"),
        ("nbd_port_data1", "10809"),
        ("repeat_times", repeat.as_str()),
        ("reconnect_time_wait", "1"),
    ]
    .into_iter()
    .collect()
}

#[tokio::test]
async fn test_full_success_path() {
    let h = Harness::new();
    h.run(params(2)).await.unwrap();

    assert_eq!(
        h.journal.host_commands(),
        vec![
            "ps -ef | grep 'qemu-nbd -p 10809' | grep -v grep",
            "fuser -k 10809/tcp",
            BLOCK,
            RESTART,
            UNBLOCK,
        ]
    );
    assert_eq!(h.io_on("vda"), 2);
    // baseline plus two verification cycles
    assert_eq!(h.io_on("vdb"), 3);
    assert_eq!(h.sleeps(), vec![Duration::from_secs(1); 5]);

    let logins = h.journal.count(|e| matches!(e, Event::Login(_)));
    let closes = h.journal.count(|e| matches!(e, Event::CloseSession(_)));
    assert_eq!(logins, closes);
}

#[tokio::test]
async fn test_loops_run_exactly_repeat_times() {
    for n in 0..5 {
        let h = Harness::new();
        h.run(params(n)).await.unwrap();

        assert_eq!(h.io_on("vda"), n as usize, "system disk cycles for n={}", n);
        assert_eq!(h.io_on("vdb"), n as usize + 1, "data disk cycles for n={}", n);
        assert_eq!(h.sleeps().len(), 2 * n as usize + 1, "waits for n={}", n);
        assert_eq!(h.host_count(UNBLOCK), 1);
    }
}

#[tokio::test]
async fn test_unblock_happens_before_data_disk_is_checked() {
    let h = Harness::new();
    h.run(params(1)).await.unwrap();

    let unblock = h
        .journal
        .position(|e| matches!(e, Event::Host(c) if c == UNBLOCK))
        .unwrap();
    let restart = h
        .journal
        .position(|e| matches!(e, Event::Host(c) if c == RESTART))
        .unwrap();
    let last_data_io = h
        .journal
        .events()
        .iter()
        .rposition(|e| matches!(e, Event::Guest { command, .. } if command.contains("of=/dev/vdb ")))
        .unwrap();
    assert!(restart < unblock);
    assert!(unblock < last_data_io);
}

#[tokio::test]
async fn test_timeout_in_second_resilience_cycle_removes_block() {
    let h = Harness::new();
    h.vm.on_nth("of=/dev/vda ", 2, GuestReply::Timeout);

    let err = h.run(params(3)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {}", err);

    assert_eq!(h.host_count(UNBLOCK), 1);
    assert_eq!(h.host_count(RESTART), 0);
    assert_eq!(h.io_on("vda"), 2);
    // only the baseline ran on the data disk
    assert_eq!(h.io_on("vdb"), 1);
    assert_eq!(
        h.journal.events().last(),
        Some(&Event::Host(UNBLOCK.to_string()))
    );
}

#[tokio::test]
async fn test_failures_after_block_unblock_exactly_once() {
    // restart of the export fails
    let h = Harness::new();
    h.host.fail(RESTART, 1, "Failed to bind socket");
    assert!(matches!(
        h.run(params(2)).await,
        Err(Error::HostCommand { status: 1, .. })
    ));
    assert_eq!(h.host_count(UNBLOCK), 1);

    // first resilience cycle fails
    let h = Harness::new();
    h.vm.on_nth(
        "of=/dev/vda ",
        1,
        GuestReply::Fail {
            status: 1,
            output: "Input/output error".to_string(),
        },
    );
    assert!(matches!(
        h.run(params(2)).await,
        Err(Error::GuestCommand { status: 1, .. })
    ));
    assert_eq!(h.host_count(UNBLOCK), 1);

    // verification cycle fails after the block was already removed
    let h = Harness::new();
    h.vm.on_nth(
        "of=/dev/vdb ",
        2,
        GuestReply::Fail {
            status: 1,
            output: "No such device".to_string(),
        },
    );
    assert!(h.run(params(2)).await.is_err());
    assert_eq!(h.host_count(UNBLOCK), 1);
}

#[tokio::test]
async fn test_failures_before_block_skip_cleanup() {
    let h = Harness::new();
    h.host.fail("fuser -k", 1, "");
    assert!(h.run(params(2)).await.is_err());
    assert_eq!(h.host_count(BLOCK), 0);
    assert_eq!(h.host_count(UNBLOCK), 0);

    // process listing without the export
    let h = Harness::new();
    let journal = Journal::new();
    let host = FakeHost::new(journal.clone());
    host.stdout("ps -ef", "");
    let clock = FakeClock::new(journal.clone());
    let mut ctx = ScenarioContext::new(params(2), &h.env, &host, &clock);
    let err = ScenarioKind::BlockKillReconnect.run(&mut ctx).await.unwrap_err();
    assert!(matches!(err, Error::TestError(_)));
    assert!(journal.host_commands().iter().all(|c| !c.starts_with("iptables")));
}

#[tokio::test]
async fn test_firewall_failures_are_not_fatal() {
    let h = Harness::new();
    h.host.fail("iptables", 2, "iptables: Bad rule");
    h.run(params(1)).await.unwrap();
    assert_eq!(h.host_count(BLOCK), 1);
    assert_eq!(h.host_count(UNBLOCK), 1);
}

#[tokio::test]
async fn test_unblock_is_idempotent() {
    let journal = Journal::new();
    let host = FakeHost::new(journal.clone());
    host.fail("iptables -D", 1, "iptables: Bad rule (does a matching rule exist in that chain?)");

    let mut net = NetworkBlock::default();
    net.unblock(&host, UNBLOCK).await;
    net.unblock(&host, UNBLOCK).await;
    assert!(!net.is_active());
    assert_eq!(journal.host_commands().len(), 2);
}

#[tokio::test]
async fn test_dead_vm_stops_before_any_host_command() {
    let h = Harness::new();
    h.vm.set_alive(false);
    assert!(matches!(h.run(params(2)).await, Err(Error::VmDead { .. })));
    assert!(h.journal.host_commands().is_empty());
}

#[tokio::test]
async fn test_missing_vm() {
    let h = Harness::new();
    let mut p = params(1);
    p.set("main_vm", "vm9");
    assert!(matches!(h.run(p).await, Err(Error::VmNotFound(name)) if name == "vm9"));
}

#[tokio::test]
async fn test_without_disk_op_only_logins_happen() {
    let h = Harness::new();
    let mut p = params(2);
    p.set("disk_op_cmd", "");
    h.run(p).await.unwrap();

    assert_eq!(h.io_on("vda") + h.io_on("vdb"), 0);
    // discovery plus two cycles per loop
    assert_eq!(h.journal.count(|e| matches!(e, Event::Login(_))), 5);
}
