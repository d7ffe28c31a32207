//! Attachment upload, sharing and deletion.
//!
//! Run with: cargo test --test attachment_test

mod common;

use common::Harness;
use mailtrack::blob::FileStore;
use mailtrack::{MailRequest, UploadRequest};

fn pdf() -> UploadRequest {
    UploadRequest::new("Quarterly Report.PDF", b"%PDF-1.7 fake".to_vec())
}

#[tokio::test]
async fn test_upload_stores_blob_and_row() {
    let h = Harness::new();

    let attachment = h.service.upload_attachment(pdf()).await.unwrap();
    assert_eq!(attachment.name, "Quarterly Report.PDF");
    assert_eq!(attachment.size, 13);
    assert!(attachment.file.starts_with("attachments/"));
    assert!(attachment.file.ends_with(".pdf"));
    assert_eq!(
        attachment.attachment_type.as_ref().map(|t| t.to_string()),
        Some("application/pdf".to_string())
    );
    assert_eq!(h.files.get(&attachment.file), Some(b"%PDF-1.7 fake".to_vec()));

    let fetched = h.service.get_attachment(&attachment.public_key).await.unwrap();
    assert_eq!(fetched, attachment);
}

#[tokio::test]
async fn test_attachment_types_are_shared() {
    let h = Harness::new();

    h.service.upload_attachment(pdf()).await.unwrap();
    h.service
        .upload_attachment(UploadRequest::new("other.bin", vec![1]).content_type("Application/PDF"))
        .await
        .unwrap();

    assert_eq!(h.store.attachment_types().len(), 1);
    assert_eq!(h.service.list_attachments().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_empty_and_malformed_uploads_are_rejected() {
    let h = Harness::new();

    let err = h
        .service
        .upload_attachment(UploadRequest::new("empty.txt", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("file"));

    let err = h
        .service
        .upload_attachment(UploadRequest::new("a.txt", vec![1]).content_type("nonsense"))
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("attachment_type"));

    assert_eq!(h.files.count(), 0);
    assert_eq!(h.store.attachment_count(), 0);
}

#[tokio::test]
async fn test_mail_deletion_keeps_attachments() {
    let h = Harness::new();
    let attachment = h.service.upload_attachment(pdf()).await.unwrap();

    let first = h
        .service
        .create_mail(
            MailRequest::new("One", "Body", "a@example.com")
                .cc("b@example.com")
                .attachment(attachment.id),
        )
        .await
        .unwrap();
    let second = h
        .service
        .create_mail(MailRequest::new("Two", "Body", "c@example.com").attachment(attachment.id))
        .await
        .unwrap();
    assert_eq!(first.attachment_ids, vec![attachment.id]);
    assert_eq!(h.store.carbon_copy_count(), 1);

    h.service.delete_mail(&first.public_key).await.unwrap();

    assert_eq!(h.store.carbon_copy_count(), 0);
    assert!(h.service.get_mail(&first.public_key).await.is_err());
    assert!(h.service.get_attachment(&attachment.public_key).await.is_ok());
    assert!(h.files.exists(&attachment.file).await.unwrap());
    let second = h.service.get_mail(&second.public_key).await.unwrap();
    assert_eq!(second.attachment_ids, vec![attachment.id]);
}

#[tokio::test]
async fn test_attachment_deletion_releases_blob() {
    let h = Harness::new();
    let attachment = h.service.upload_attachment(pdf()).await.unwrap();
    let mail = h
        .service
        .create_mail(MailRequest::new("One", "Body", "a@example.com").attachment(attachment.id))
        .await
        .unwrap();

    let deletion = h.service.delete_attachment(&attachment.public_key).await.unwrap();
    assert!(deletion.blob_released);
    assert_eq!(h.files.count(), 0);

    let mail = h.service.get_mail(&mail.public_key).await.unwrap();
    assert!(mail.attachment_ids.is_empty());
}

#[tokio::test]
async fn test_blob_release_is_retried() {
    let h = Harness::new();
    let attachment = h.service.upload_attachment(pdf()).await.unwrap();

    h.files.fail_next_deletes(2);
    let deletion = h.service.delete_attachment(&attachment.public_key).await.unwrap();

    assert!(deletion.blob_released);
    assert_eq!(h.files.count(), 0);
}

#[tokio::test]
async fn test_blob_outage_reports_orphan() {
    let h = Harness::new();
    let attachment = h.service.upload_attachment(pdf()).await.unwrap();

    h.files.fail_next_deletes(10);
    let deletion = h.service.delete_attachment(&attachment.public_key).await.unwrap();

    assert!(!deletion.blob_released);
    assert_eq!(h.store.attachment_count(), 0);
    assert!(h.files.get(&attachment.file).is_some());
}
