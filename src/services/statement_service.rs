//! Plain-text invoice statements
//!
//! Served as a downloadable attachment in place of a typeset document.

use rust_decimal::Decimal;

use crate::models::Invoice;

fn money(amount: Decimal) -> String {
    format!("₹{:.2}", amount)
}

/// Plain-text invoice statement
pub fn render_statement(invoice: &Invoice) -> String {
    let mut lines = vec![
        format!("{:^48}", "INVOICE"),
        String::new(),
        format!("Invoice Number: {}", invoice.invoice_number),
        format!("Date: {}", invoice.created_at.format("%d/%m/%Y")),
        format!("Status: {}", invoice.status),
        String::new(),
        "Items:".to_string(),
    ];

    lines.extend(invoice.items.iter().map(|item| {
        format!(
            "{} - Qty: {} x {} = {}",
            item.description,
            item.quantity,
            money(item.unit_price),
            money(item.amount)
        )
    }));
    lines.push(String::new());

    lines.push(format!("Subtotal: {}", money(invoice.subtotal)));
    if invoice.discount_amount > Decimal::ZERO {
        lines.push(format!("Discount: -{}", money(invoice.discount_amount)));
    }
    if invoice.tax_amount > Decimal::ZERO {
        lines.push(format!("Tax: {}", money(invoice.tax_amount)));
    }
    lines.push(format!("Total: {}", money(invoice.total)));
    lines.push(format!("Paid: {}", money(invoice.paid_amount)));
    lines.push(format!("Balance: {}", money(invoice.balance_amount)));

    if !invoice.payments.is_empty() {
        lines.push(String::new());
        lines.push("Payments:".to_string());
        lines.extend(invoice.payments.iter().map(|payment| {
            format!(
                "{} via {} on {}",
                money(payment.amount),
                payment.method,
                payment.received_at.format("%d/%m/%Y")
            )
        }));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
