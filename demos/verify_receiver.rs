use postback_dispatcher::{compute_signature, verify_signature};

fn main() {
    let secret = b"supersecret";
    // Payload as rendered from "{click_id}:{txid}:{status}".
    let payload = b"clk_abc:order_9:sale";

    let received = compute_signature(secret, payload);

    let valid = verify_signature(secret, payload, &received);
    let tampered = verify_signature(secret, b"clk_abc:order_9:rejected", &received);

    println!("valid: {valid}, tampered: {tampered}");
}
