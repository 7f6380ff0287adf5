//! SQRL 协议引擎端到端测试
//!
//! 模拟 SQRL 客户端：签名 client || server，按应答中的 nut / server 继续下一轮请求

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use sqrl_protocol::correlator::TRANSIENT_SERVER_REPLY;
use sqrl_protocol::encoding::{base64url_decode_string, base64url_encode};
use sqrl_protocol::identity::IdentityFlag;
use sqrl_protocol::request::parse_name_values;
use sqrl_protocol::storage::{MemoryBackend, SqliteBackend, SqliteConfig};
use sqrl_protocol::{
    CleanupStats, Correlator, CorrelatorStatus, ProtocolConfig, RawSqrlRequest, SqrlEngine,
    SqrlError, SqrlPersistence, SqrlReply, SqrlResult, SqrlTransaction, TifFlag, unix_timestamp,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tempfile::tempdir;

const NUT_KEY: &str = "000102030405060708090a0b0c0d0e0f";

fn client_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))
}

fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        nut_key: Some(NUT_KEY.to_string()),
        backchannel_url: "sqrl://example.com/sqrl".to_string(),
        cps_url: Some("https://example.com/cps".to_string()),
        ..Default::default()
    }
}

fn engine_with(config: ProtocolConfig, store: Arc<dyn SqrlPersistence>) -> SqrlEngine {
    SqrlEngine::new(config, store).unwrap()
}

fn memory_engine() -> SqrlEngine {
    engine_with(test_config(), Arc::new(MemoryBackend::new()))
}

/// 模拟的 SQRL 客户端身份
struct TestIdentity {
    identity: SigningKey,
    unlock: SigningKey,
}

impl TestIdentity {
    fn new(seed: u8) -> Self {
        Self {
            identity: SigningKey::from_bytes(&[seed; 32]),
            unlock: SigningKey::from_bytes(&[seed.wrapping_add(100); 32]),
        }
    }

    fn idk(&self) -> String {
        base64url_encode(self.identity.verifying_key().to_bytes())
    }

    fn vuk(&self) -> String {
        base64url_encode(self.unlock.verifying_key().to_bytes())
    }

    fn suk(&self) -> String {
        base64url_encode([0x5a; 32])
    }
}

/// 一次认证会话（一个关联器）
struct Session<'a> {
    engine: &'a SqrlEngine,
    ip: IpAddr,
    cor: String,
    nut: String,
    server: String,
}

/// 单次请求的附加内容
#[derive(Default)]
struct Extra<'a> {
    opt: Option<&'a str>,
    ver: Option<&'a str>,
    enroll: bool,
    previous: Option<&'a TestIdentity>,
    unlock: bool,
    tamper_ids: bool,
}

impl<'a> Session<'a> {
    async fn start(engine: &'a SqrlEngine) -> Session<'a> {
        let page = engine.begin_authentication(&client_ip()).await.unwrap();
        Session {
            engine,
            ip: client_ip(),
            cor: page.correlator_id,
            nut: page.nut,
            server: base64url_encode(page.sqrl_url),
        }
    }

    fn build(&self, who: &TestIdentity, cmd: &str, extra: &Extra<'_>) -> RawSqrlRequest {
        let mut client = format!(
            "ver={}\r\ncmd={cmd}\r\nidk={}\r\n",
            extra.ver.unwrap_or("1"),
            who.idk()
        );
        if let Some(previous) = extra.previous {
            client.push_str(&format!("pidk={}\r\n", previous.idk()));
        }
        if extra.enroll {
            client.push_str(&format!("suk={}\r\nvuk={}\r\n", who.suk(), who.vuk()));
        }
        if let Some(opt) = extra.opt {
            client.push_str(&format!("opt={opt}\r\n"));
        }
        let client = base64url_encode(client);

        let message = format!("{client}{}", self.server);
        let mut ids = who.identity.sign(message.as_bytes()).to_bytes();
        if extra.tamper_ids {
            ids[0] ^= 0x01;
        }

        RawSqrlRequest {
            nut: Some(self.nut.clone()),
            cor: Some(self.cor.clone()),
            client: Some(client),
            server: Some(self.server.clone()),
            ids: Some(base64url_encode(ids)),
            pids: extra
                .previous
                .map(|p| base64url_encode(p.identity.sign(message.as_bytes()).to_bytes())),
            urs: extra
                .unlock
                .then(|| base64url_encode(who.unlock.sign(message.as_bytes()).to_bytes())),
        }
    }

    async fn send(&mut self, who: &TestIdentity, cmd: &str, extra: Extra<'_>) -> SqrlReply {
        let raw = self.build(who, cmd, &extra);
        let reply = self.engine.handle_request(raw, &self.ip).await.unwrap();
        self.nut = reply.nut.clone();
        self.server = reply.encoded.clone();
        reply
    }

    async fn correlator(&self) -> Correlator {
        let mut tx = self.engine.persistence().begin().await.unwrap();
        let correlator = tx.correlator_fetch_required(&self.cor).await.unwrap();
        tx.rollback().await.unwrap();
        correlator
    }
}

fn reply_fields(reply: &SqrlReply) -> BTreeMap<String, String> {
    parse_name_values(&base64url_decode_string(&reply.encoded).unwrap()).unwrap()
}

async fn identity_exists(engine: &SqrlEngine, idk: &str) -> bool {
    let mut tx = engine.persistence().begin().await.unwrap();
    let exists = tx.identity_exists_by_idk(idk).await.unwrap();
    tx.rollback().await.unwrap();
    exists
}

async fn enroll(engine: &SqrlEngine, who: &TestIdentity) {
    let mut session = Session::start(engine).await;
    session.send(who, "query", Extra::default()).await;
    let reply = session
        .send(
            who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;
    assert!(!reply.tif.contains(TifFlag::CommandFailed));
}

async fn end_to_end(engine: &SqrlEngine) {
    let ip = client_ip();
    let who = TestIdentity::new(1);

    // 直接创建关联器 cor1
    let (_, nut) = engine.nut_context().mint(&ip);
    let mut tx = engine.persistence().begin().await.unwrap();
    let correlator = tx
        .correlator_create("cor1", unix_timestamp() + 60)
        .await
        .unwrap();
    assert_eq!(correlator.status(), CorrelatorStatus::CorrelatorIssued);
    tx.commit().await.unwrap();

    let mut session = Session {
        engine,
        ip,
        cor: "cor1".to_string(),
        server: base64url_encode(engine.sqrl_url(&nut, "cor1")),
        nut,
    };

    let reply = session.send(&who, "query", Extra::default()).await;
    assert!(!reply.tif.contains(TifFlag::IdMatch));
    assert!(!reply.tif.contains(TifFlag::PreviousIdMatch));
    assert!(reply.tif.contains(TifFlag::IpsMatched));
    assert!(!identity_exists(engine, &who.idk()).await);
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::Communicating
    );

    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;
    assert!(!reply.tif.contains(TifFlag::CommandFailed));
    assert!(reply.tif.contains(TifFlag::IdMatch));

    let correlator = session.correlator().await;
    assert_eq!(correlator.status(), CorrelatorStatus::AuthenticatedBrowser);
    assert_eq!(correlator.authenticated_identity().unwrap(), who.idk());
    assert_eq!(
        correlator.transient(TRANSIENT_SERVER_REPLY),
        Some(reply.encoded.as_str())
    );

    let mut tx = engine.persistence().begin().await.unwrap();
    assert_eq!(
        tx.fetch_identity_data(&who.idk(), "suk").await.unwrap(),
        Some(who.suk())
    );
    assert_eq!(
        tx.get_flag(&who.idk(), IdentityFlag::SqrlAuthEnabled)
            .await
            .unwrap(),
        Some(true)
    );
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_end_to_end_memory() {
    end_to_end(&memory_engine()).await;
}

#[tokio::test]
async fn test_end_to_end_sqlite() {
    let dir = tempdir().unwrap();
    let store = SqliteBackend::new(&SqliteConfig::default(), dir.path())
        .await
        .unwrap();
    end_to_end(&engine_with(test_config(), Arc::new(store))).await;
}

#[tokio::test]
async fn test_reply_fields() {
    let engine = memory_engine();
    let who = TestIdentity::new(2);
    let mut session = Session::start(&engine).await;

    let reply = session.send(&who, "query", Extra::default()).await;
    let fields = reply_fields(&reply);
    assert_eq!(fields["ver"], "1");
    assert_eq!(fields["nut"], reply.nut);
    assert_eq!(fields["tif"], "4");
    assert_eq!(
        fields["qry"],
        format!("/sqrl?nut={}&cor={}", reply.nut, session.cor)
    );
    assert_eq!(fields["cor"], session.cor);
    assert!(!fields.contains_key("suk"));
}

#[tokio::test]
async fn test_cps_flow() {
    let engine = memory_engine();
    let who = TestIdentity::new(3);
    let mut session = Session::start(&engine).await;

    session.send(&who, "query", Extra::default()).await;
    // 仍在通信中时无法读取已认证身份
    assert!(matches!(
        engine.authenticated_identity(&session.cor).await,
        Err(SqrlError::IllegalState(_))
    ));

    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                opt: Some("cps~suk"),
                ..Default::default()
            },
        )
        .await;

    let correlator = session.correlator().await;
    assert_eq!(correlator.status(), CorrelatorStatus::AuthenticatedCps);
    assert_eq!(
        engine.authenticated_identity(&session.cor).await.unwrap(),
        who.idk()
    );

    let fields = reply_fields(&reply);
    let url = url::Url::parse(&fields["url"]).unwrap();
    assert!(url.as_str().starts_with("https://example.com/cps?"));
    let token = url
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    // suk 选项：身份已存在，返回已存储的 suk / vuk
    assert_eq!(fields["suk"], who.suk());
    assert_eq!(fields["vuk"], who.vuk());

    assert!(engine.redeem_cps_token(&session.cor, "wrong").await.is_err());
    assert_eq!(
        engine.redeem_cps_token(&session.cor, &token).await.unwrap(),
        who.idk()
    );
    // 一次性
    assert!(engine.redeem_cps_token(&session.cor, &token).await.is_err());
}

#[tokio::test]
async fn test_tampered_signature() {
    let engine = memory_engine();
    let who = TestIdentity::new(4);
    let mut session = Session::start(&engine).await;

    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                tamper_ids: true,
                ..Default::default()
            },
        )
        .await;

    assert!(reply.tif.contains(TifFlag::ClientFailure));
    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert!(!identity_exists(&engine, &who.idk()).await);
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::ErrorBadRequest
    );
}

#[tokio::test]
async fn test_sanitization_has_no_side_effects() {
    let engine = memory_engine();
    let who = TestIdentity::new(5);
    let session = Session::start(&engine).await;

    let mut raw = session.build(&who, "query", &Extra::default());
    raw.client = Some("<script>alert(1)</script>".to_string());
    assert!(matches!(
        engine.handle_request(raw, &client_ip()).await,
        Err(SqrlError::InvalidData(_))
    ));

    let mut raw = session.build(&who, "query", &Extra::default());
    raw.ids = Some("A".repeat(30_001));
    assert!(matches!(
        engine.handle_request(raw, &client_ip()).await,
        Err(SqrlError::InvalidData(_))
    ));

    // 关联器与 Nut 都未被触及
    let correlator = session.correlator().await;
    assert_eq!(correlator.status(), CorrelatorStatus::CorrelatorIssued);
    assert!(correlator.transient_auth_data().is_empty());
    let mut tx = engine.persistence().begin().await.unwrap();
    assert!(!tx.has_token_been_used(&session.nut).await.unwrap());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_nut_replay_rejected() {
    let engine = memory_engine();
    let who = TestIdentity::new(6);
    let mut session = Session::start(&engine).await;

    let first = session.build(&who, "query", &Extra::default());
    let replayed = first.clone();
    let reply = engine.handle_request(first, &client_ip()).await.unwrap();
    assert!(!reply.tif.contains(TifFlag::CommandFailed));

    let mut tx = engine.persistence().begin().await.unwrap();
    assert!(tx.has_token_been_used(&session.nut).await.unwrap());
    tx.rollback().await.unwrap();

    let reply = engine.handle_request(replayed, &client_ip()).await.unwrap();
    assert!(reply.tif.contains(TifFlag::ClientFailure));
    session.nut = reply.nut;
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::ErrorBadRequest
    );
}

#[tokio::test]
async fn test_followup_requires_issued_nut() {
    let engine = memory_engine();
    let who = TestIdentity::new(16);
    let mut session = Session::start(&engine).await;
    session.send(&who, "query", Extra::default()).await;

    // 另一个登录页面的 Nut 同样有效且未使用，但不是本关联器上一次应答签发的
    let other_page = engine.begin_authentication(&client_ip()).await.unwrap();
    session.nut = other_page.nut;

    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;
    assert!(reply.tif.contains(TifFlag::ClientFailure));
    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert!(!identity_exists(&engine, &who.idk()).await);
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::ErrorBadRequest
    );
}

#[tokio::test]
async fn test_pidk_without_pids_fails() {
    let engine = memory_engine();
    let old = TestIdentity::new(17);
    let new = TestIdentity::new(18);
    enroll(&engine, &old).await;

    let session = Session::start(&engine).await;
    let mut raw = session.build(
        &new,
        "query",
        &Extra {
            previous: Some(&old),
            ..Default::default()
        },
    );
    raw.pids = None;

    let reply = engine.handle_request(raw, &client_ip()).await.unwrap();
    assert!(reply.tif.contains(TifFlag::ClientFailure));
    assert!(!reply.tif.contains(TifFlag::PreviousIdMatch));
    // 未发生迁移
    assert!(identity_exists(&engine, &old.idk()).await);
    assert!(!identity_exists(&engine, &new.idk()).await);
}

async fn lock_flags(engine: &SqrlEngine, idk: &str) -> (Option<bool>, Option<bool>) {
    let mut tx = engine.persistence().begin().await.unwrap();
    let sqrl_only = tx.get_flag(idk, IdentityFlag::SqrlOnly).await.unwrap();
    let hardlock = tx.get_flag(idk, IdentityFlag::Hardlock).await.unwrap();
    tx.rollback().await.unwrap();
    (sqrl_only, hardlock)
}

#[tokio::test]
async fn test_query_options_do_not_change_flags() {
    let engine = memory_engine();
    let who = TestIdentity::new(19);
    enroll(&engine, &who).await;

    let before = lock_flags(&engine, &who.idk()).await;

    let mut session = Session::start(&engine).await;
    let reply = session
        .send(
            &who,
            "query",
            Extra {
                opt: Some("sqrlonly~hardlock"),
                ..Default::default()
            },
        )
        .await;
    assert!(reply.tif.contains(TifFlag::IdMatch));
    assert!(!reply.tif.contains(TifFlag::CommandFailed));

    assert_eq!(lock_flags(&engine, &who.idk()).await, before);
    assert_ne!(before, (Some(true), Some(true)));
}

#[tokio::test]
async fn test_expired_and_corrupt_nut_look_identical() {
    let engine = memory_engine();
    let who = TestIdentity::new(7);

    let mut expired = Session::start(&engine).await;
    let (_, old_nut) = engine
        .nut_context()
        .mint_at(&client_ip(), unix_timestamp() - 2_000);
    expired.server = base64url_encode(engine.sqrl_url(&old_nut, &expired.cor));
    expired.nut = old_nut;
    let expired_reply = expired.send(&who, "query", Extra::default()).await;

    let mut corrupt = Session::start(&engine).await;
    corrupt.nut = "B".repeat(22);
    corrupt.server = base64url_encode(engine.sqrl_url(&corrupt.nut, &corrupt.cor));
    let corrupt_reply = corrupt.send(&who, "query", Extra::default()).await;

    assert!(expired_reply.tif.contains(TifFlag::ClientFailure));
    assert!(corrupt_reply.tif.contains(TifFlag::ClientFailure));
    assert_eq!(
        expired_reply.tif.bits() & !TifFlag::IpsMatched.bits(),
        corrupt_reply.tif.bits() & !TifFlag::IpsMatched.bits()
    );
}

#[tokio::test]
async fn test_version_negotiation_failure() {
    let engine = memory_engine();
    let who = TestIdentity::new(8);
    let mut session = Session::start(&engine).await;

    let reply = session
        .send(
            &who,
            "query",
            Extra {
                ver: Some("2-4"),
                ..Default::default()
            },
        )
        .await;
    assert!(reply.tif.contains(TifFlag::FunctionNotSupported));
    assert!(reply.tif.contains(TifFlag::ClientFailure));
}

#[tokio::test]
async fn test_unsupported_command() {
    let engine = memory_engine();
    let who = TestIdentity::new(9);
    let mut session = Session::start(&engine).await;

    let reply = session.send(&who, "launch", Extra::default()).await;
    assert!(reply.tif.contains(TifFlag::FunctionNotSupported));
    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::ErrorBadRequest
    );
}

#[tokio::test]
async fn test_disable_enable_remove() {
    let engine = memory_engine();
    let who = TestIdentity::new(10);
    enroll(&engine, &who).await;

    // disable
    let mut session = Session::start(&engine).await;
    session.send(&who, "query", Extra::default()).await;
    let reply = session.send(&who, "disable", Extra::default()).await;
    assert!(reply.tif.contains(TifFlag::SqrlDisabled));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::SqrlUserDisabled
    );

    // 已禁用的身份无法 ident
    let mut session = Session::start(&engine).await;
    let reply = session.send(&who, "query", Extra::default()).await;
    assert!(reply.tif.contains(TifFlag::IdMatch));
    assert!(reply.tif.contains(TifFlag::SqrlDisabled));
    let reply = session.send(&who, "ident", Extra::default()).await;
    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::SqrlUserDisabled
    );

    // enable 需要 urs
    let mut session = Session::start(&engine).await;
    session.send(&who, "query", Extra::default()).await;
    let reply = session.send(&who, "enable", Extra::default()).await;
    assert!(reply.tif.contains(TifFlag::ClientFailure));

    let mut session = Session::start(&engine).await;
    session.send(&who, "query", Extra::default()).await;
    let reply = session
        .send(
            &who,
            "enable",
            Extra {
                unlock: true,
                opt: Some("sqrlonly"),
                ..Default::default()
            },
        )
        .await;
    assert!(!reply.tif.contains(TifFlag::CommandFailed));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::Communicating
    );
    let mut tx = engine.persistence().begin().await.unwrap();
    assert_eq!(
        tx.get_flag(&who.idk(), IdentityFlag::SqrlAuthEnabled)
            .await
            .unwrap(),
        Some(true)
    );
    assert_eq!(
        tx.get_flag(&who.idk(), IdentityFlag::SqrlOnly).await.unwrap(),
        Some(true)
    );
    tx.rollback().await.unwrap();

    // remove
    let reply = session
        .send(
            &who,
            "remove",
            Extra {
                unlock: true,
                ..Default::default()
            },
        )
        .await;
    assert!(!reply.tif.contains(TifFlag::CommandFailed));
    assert!(!identity_exists(&engine, &who.idk()).await);
}

#[tokio::test]
async fn test_remove_unknown_identity_fails() {
    let engine = memory_engine();
    let who = TestIdentity::new(11);
    let mut session = Session::start(&engine).await;

    let reply = session
        .send(
            &who,
            "remove",
            Extra {
                unlock: true,
                ..Default::default()
            },
        )
        .await;
    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert!(reply.tif.contains(TifFlag::ClientFailure));
}

#[tokio::test]
async fn test_identity_rotation() {
    let engine = memory_engine();
    let old = TestIdentity::new(12);
    let new = TestIdentity::new(13);
    enroll(&engine, &old).await;

    let mut session = Session::start(&engine).await;
    let reply = session
        .send(
            &new,
            "query",
            Extra {
                previous: Some(&old),
                ..Default::default()
            },
        )
        .await;
    assert!(reply.tif.contains(TifFlag::PreviousIdMatch));
    assert!(!reply.tif.contains(TifFlag::IdMatch));

    assert!(!identity_exists(&engine, &old.idk()).await);
    assert!(identity_exists(&engine, &new.idk()).await);

    let mut tx = engine.persistence().begin().await.unwrap();
    // 旧身份的数据随之迁移
    assert_eq!(
        tx.fetch_identity_data(&new.idk(), "vuk").await.unwrap(),
        Some(old.vuk())
    );
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_new_identity_requires_keys() {
    let engine = memory_engine();
    let who = TestIdentity::new(14);
    let mut session = Session::start(&engine).await;

    session.send(&who, "query", Extra::default()).await;
    let reply = session.send(&who, "ident", Extra::default()).await;
    assert!(reply.tif.contains(TifFlag::ClientFailure));
    assert!(!identity_exists(&engine, &who.idk()).await);
}

#[tokio::test]
async fn test_server_echo_mismatch() {
    let engine = memory_engine();
    let who = TestIdentity::new(15);
    let mut session = Session::start(&engine).await;

    session.send(&who, "query", Extra::default()).await;
    session.server = base64url_encode("ver=1\r\ntif=0\r\n");
    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;
    assert!(reply.tif.contains(TifFlag::ClientFailure));
    assert!(!identity_exists(&engine, &who.idk()).await);
}

#[tokio::test]
async fn test_completed_correlator_rejects_requests() {
    let engine = memory_engine();
    let who = TestIdentity::new(16);
    let mut session = Session::start(&engine).await;

    session.send(&who, "query", Extra::default()).await;
    session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;

    let reply = session.send(&who, "query", Extra::default()).await;
    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::AuthenticatedBrowser
    );
}

#[tokio::test]
async fn test_unknown_correlator() {
    let engine = memory_engine();
    let who = TestIdentity::new(17);
    let mut session = Session::start(&engine).await;
    session.cor = "bm9wZQ".to_string();

    let raw = session.build(&who, "query", &Extra::default());
    assert!(matches!(
        engine.handle_request(raw, &client_ip()).await,
        Err(SqrlError::CorrelatorNotFound(_))
    ));
}

#[tokio::test]
async fn test_enforced_ip_match() {
    let config = ProtocolConfig {
        enforce_ip_match: true,
        ..test_config()
    };
    let engine = engine_with(config, Arc::new(MemoryBackend::new()));
    let who = TestIdentity::new(18);
    let other_ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));

    // 每个应答的 Nut 绑定发出请求的 IP，交替切换 IP 使每次都不匹配
    let mut session = Session::start(&engine).await;
    session.ip = other_ip;

    // query 不受 IP 策略影响
    let reply = session.send(&who, "query", Extra::default()).await;
    assert!(!reply.tif.contains(TifFlag::IpsMatched));
    assert!(!reply.tif.contains(TifFlag::CommandFailed));

    session.ip = client_ip();
    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;
    assert!(!reply.tif.contains(TifFlag::IpsMatched));
    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert!(!reply.tif.contains(TifFlag::ClientFailure));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::Communicating
    );
    assert!(!identity_exists(&engine, &who.idk()).await);

    session.ip = other_ip;
    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                opt: Some("noiptest"),
                ..Default::default()
            },
        )
        .await;
    assert!(!reply.tif.contains(TifFlag::IpsMatched));
    assert!(!reply.tif.contains(TifFlag::CommandFailed));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::AuthenticatedBrowser
    );
}

async fn cleanup_removes_expired(store: Arc<dyn SqrlPersistence>) {
    let now = unix_timestamp();
    let mut tx = store.begin().await.unwrap();
    tx.correlator_create("expired", now - 1).await.unwrap();
    tx.correlator_create("alive", now + 5).await.unwrap();
    tx.mark_token_used("expired", "old-nut", now - 1).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let stats = tx.cleanup_expired(unix_timestamp()).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        stats,
        CleanupStats {
            correlators: 1,
            used_nuts: 1
        }
    );

    let mut tx = store.begin().await.unwrap();
    assert!(matches!(
        tx.correlator_fetch_required("expired").await,
        Err(SqrlError::CorrelatorNotFound(_))
    ));
    assert!(tx.correlator_fetch_required("alive").await.is_ok());
    assert!(!tx.has_token_been_used("old-nut").await.unwrap());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_cleanup_memory() {
    cleanup_removes_expired(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn test_cleanup_sqlite() {
    let dir = tempdir().unwrap();
    let store = SqliteBackend::new(&SqliteConfig::default(), dir.path())
        .await
        .unwrap();
    cleanup_removes_expired(Arc::new(store)).await;
}

#[tokio::test]
async fn test_status_snapshot() {
    let engine = memory_engine();
    let who = TestIdentity::new(19);
    let mut session = Session::start(&engine).await;

    let snapshot = engine.correlator_status(&session.cor).await.unwrap();
    assert_eq!(snapshot.status, CorrelatorStatus::CorrelatorIssued);
    assert!(!snapshot.complete);

    session.send(&who, "query", Extra::default()).await;
    session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;

    let snapshot = engine.correlator_status(&session.cor).await.unwrap();
    assert_eq!(snapshot.status, CorrelatorStatus::AuthenticatedBrowser);
    assert!(snapshot.authenticated);
    assert!(snapshot.complete);
}

#[tokio::test]
async fn test_missing_nut_key_is_illegal_state() {
    let config = ProtocolConfig {
        nut_key: None,
        ..test_config()
    };
    assert!(matches!(
        SqrlEngine::new(config, Arc::new(MemoryBackend::new())),
        Err(SqrlError::IllegalState(_))
    ));
}

// ---- 回读不一致的存储 ----

/// 写入正常、回读返回错误数据的存储
struct CorruptingStore {
    inner: MemoryBackend,
}

struct CorruptingTransaction {
    inner: Box<dyn SqrlTransaction>,
}

#[async_trait]
impl SqrlPersistence for CorruptingStore {
    async fn begin(&self) -> SqrlResult<Box<dyn SqrlTransaction>> {
        Ok(Box::new(CorruptingTransaction {
            inner: self.inner.begin().await?,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "corrupting"
    }
}

#[async_trait]
impl SqrlTransaction for CorruptingTransaction {
    async fn identity_exists_by_idk(&mut self, idk: &str) -> SqrlResult<bool> {
        self.inner.identity_exists_by_idk(idk).await
    }
    async fn rotate_idk(&mut self, old_idk: &str, new_idk: &str) -> SqrlResult<()> {
        self.inner.rotate_idk(old_idk, new_idk).await
    }
    async fn store_identity_data(
        &mut self,
        idk: &str,
        data: &BTreeMap<String, String>,
    ) -> SqrlResult<()> {
        self.inner.store_identity_data(idk, data).await
    }
    async fn fetch_identity_data(&mut self, _idk: &str, _key: &str) -> SqrlResult<Option<String>> {
        Ok(Some("corrupted".to_string()))
    }
    async fn set_flag(&mut self, idk: &str, flag: IdentityFlag, value: bool) -> SqrlResult<()> {
        self.inner.set_flag(idk, flag, value).await
    }
    async fn get_flag(&mut self, idk: &str, flag: IdentityFlag) -> SqrlResult<Option<bool>> {
        self.inner.get_flag(idk, flag).await
    }
    async fn delete_identity(&mut self, idk: &str) -> SqrlResult<()> {
        self.inner.delete_identity(idk).await
    }
    async fn native_user_xref(&mut self, idk: &str) -> SqrlResult<Option<String>> {
        self.inner.native_user_xref(idk).await
    }
    async fn set_native_user_xref(&mut self, idk: &str, xref: &str) -> SqrlResult<()> {
        self.inner.set_native_user_xref(idk, xref).await
    }
    async fn mark_authenticated(&mut self, idk: &str, correlator_id: &str) -> SqrlResult<()> {
        self.inner.mark_authenticated(idk, correlator_id).await
    }
    async fn correlator_fetch_required(&mut self, id: &str) -> SqrlResult<Correlator> {
        self.inner.correlator_fetch_required(id).await
    }
    async fn correlator_create(&mut self, id: &str, expires_at: u64) -> SqrlResult<Correlator> {
        self.inner.correlator_create(id, expires_at).await
    }
    async fn correlator_update(&mut self, correlator: &Correlator) -> SqrlResult<()> {
        self.inner.correlator_update(correlator).await
    }
    async fn transient_data_fetch(
        &mut self,
        correlator_id: &str,
        key: &str,
    ) -> SqrlResult<Option<String>> {
        self.inner.transient_data_fetch(correlator_id, key).await
    }
    async fn has_token_been_used(&mut self, token: &str) -> SqrlResult<bool> {
        self.inner.has_token_been_used(token).await
    }
    async fn mark_token_used(
        &mut self,
        correlator_id: &str,
        token: &str,
        expires_at: u64,
    ) -> SqrlResult<()> {
        self.inner
            .mark_token_used(correlator_id, token, expires_at)
            .await
    }
    async fn cleanup_expired(&mut self, now: u64) -> SqrlResult<CleanupStats> {
        self.inner.cleanup_expired(now).await
    }
    async fn commit(self: Box<Self>) -> SqrlResult<()> {
        self.inner.commit().await
    }
    async fn rollback(self: Box<Self>) -> SqrlResult<()> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn test_persistence_failure_is_server_error() {
    let inner = MemoryBackend::new();
    let engine = engine_with(
        test_config(),
        Arc::new(CorruptingStore {
            inner: inner.clone(),
        }),
    );
    let who = TestIdentity::new(20);
    let mut session = Session::start(&engine).await;

    session.send(&who, "query", Extra::default()).await;
    let reply = session
        .send(
            &who,
            "ident",
            Extra {
                enroll: true,
                ..Default::default()
            },
        )
        .await;

    assert!(reply.tif.contains(TifFlag::CommandFailed));
    assert!(!reply.tif.contains(TifFlag::ClientFailure));
    assert_eq!(
        session.correlator().await.status(),
        CorrelatorStatus::ErrorSqrlInternal
    );

    // 写入已回滚
    let mut tx = inner.begin().await.unwrap();
    assert!(!tx.identity_exists_by_idk(&who.idk()).await.unwrap());
    tx.rollback().await.unwrap();
}
