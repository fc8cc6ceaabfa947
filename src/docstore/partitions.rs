/// Key layout for the document-store partitions
///
/// - `jobs`: job:{uuid} -> JobRecord (JSON)
/// - `profiles`: profile:{user_id} -> UserProfile (JSON)
/// - `ledger`: entry:{user_id}:{seq:016} -> LedgerEntry (JSON)
/// - `ledger_by_job`: job:{uuid}:{seq:016} -> LedgerEntry (JSON)
/// - `deadletters`: dl-{uuid} -> DeadLetterEntry (JSON)
/// - `audits`: moderation:{seq:016} / replay:{seq:016} -> audit (JSON)
/// - `metadata`: counters and pruning cursors
use uuid::Uuid;

pub fn job_key(job_id: Uuid) -> Vec<u8> {
    format!("job:{job_id}").into_bytes()
}

pub fn profile_key(user_id: &str) -> Vec<u8> {
    format!("profile:{user_id}").into_bytes()
}

pub fn ledger_key(user_id: &str, seq: u64) -> Vec<u8> {
    format!("entry:{user_id}:{seq:016}").into_bytes()
}

pub fn ledger_user_prefix(user_id: &str) -> Vec<u8> {
    format!("entry:{user_id}:").into_bytes()
}

pub fn ledger_job_key(job_id: Uuid, seq: u64) -> Vec<u8> {
    format!("job:{job_id}:{seq:016}").into_bytes()
}

pub fn ledger_job_prefix(job_id: Uuid) -> Vec<u8> {
    format!("job:{job_id}:").into_bytes()
}

pub fn moderation_audit_key(seq: u64) -> Vec<u8> {
    format!("moderation:{seq:016}").into_bytes()
}

pub fn replay_audit_key(seq: u64) -> Vec<u8> {
    format!("replay:{seq:016}").into_bytes()
}

pub fn meta_key(name: &str) -> Vec<u8> {
    format!("meta:{name}").into_bytes()
}
