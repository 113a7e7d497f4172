use webhook_relay::{verify_webhook_request, Authenticator, SIGNATURE_HEADER, TIMESTAMP_HEADER};

fn main() {
    let secret = "supersecret";
    let payload = br#"{"id":"evt_123","type":"order.created"}"#;
    let now_secs = 1_700_000_200;

    // What a sender would attach.
    let signature = Authenticator.sign(payload, secret);
    let timestamp = "1700000000";
    let headers = [(SIGNATURE_HEADER, signature.as_str()), (TIMESTAMP_HEADER, timestamp)];

    match verify_webhook_request(headers, payload, secret, 300, now_secs) {
        Ok(()) => println!("signature valid"),
        Err(e) => println!("rejected: {e}"),
    }

    let tampered = br#"{"id":"evt_123","type":"order.refunded"}"#;
    match verify_webhook_request(headers, tampered, secret, 300, now_secs) {
        Ok(()) => println!("signature valid"),
        Err(e) => println!("rejected tampered payload: {e}"),
    }
}
